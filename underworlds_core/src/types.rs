//! Replicated data model: nodes, situations, meshes, roles and topology.

use nalgebra::{Matrix4, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use underworlds_env::{ClientId, InvalidationKind, InvalidationTarget, Timestamp};
use uuid::Uuid;

/// Current version of the node properties schema.
pub const PROPERTIES_SCHEMA_VERSION: u32 = 1;

/// Display name of every world's root node.
pub const ROOT_NAME: &str = "root";

/// Opaque node identifier, generated by the node's creator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    /// Wraps an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Uuid> for NodeId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid.to_string())
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque situation identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SituationId(pub String);

impl SituationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for SituationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for SituationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content hash of a mesh blob (lowercase hex).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MeshId(pub String);

impl MeshId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for MeshId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of scene node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    #[default]
    Undefined,
    /// Geometry-bearing node; see `NodeProperties::mesh_ids`
    Mesh,
    /// Group of nodes (rigid or articulated body)
    Entity,
    /// Viewpoint; see `NodeProperties::camera`
    Camera,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodeType::Undefined => "undefined",
            NodeType::Mesh => "mesh",
            NodeType::Entity => "entity",
            NodeType::Camera => "camera",
        };
        f.write_str(name)
    }
}

/// Pinhole camera intrinsics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    /// Width / height
    pub aspect: f64,
    /// Horizontal field of view, in degrees
    pub horizontal_fov: f64,
    /// Near clipping plane, in meters
    pub clip_near: f64,
    /// Far clipping plane, in meters
    pub clip_far: f64,
}

impl Default for CameraIntrinsics {
    fn default() -> Self {
        Self {
            aspect: 1.3333,
            horizontal_fov: 60.0,
            clip_near: 0.1,
            clip_far: 100.0,
        }
    }
}

/// Axis-aligned bounding box, in node-local coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

/// Value of a forward-compatible property extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtensionValue {
    Text(String),
    Bytes(Vec<u8>),
}

/// Well-known node properties plus an open extension map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeProperties {
    pub schema_version: u32,

    /// Whether the node takes part in physics simulation
    pub physics: bool,

    /// Mesh blobs composing the node (mesh nodes only)
    pub mesh_ids: Vec<MeshId>,

    /// Camera intrinsics (camera nodes only)
    pub camera: Option<CameraIntrinsics>,

    pub aabb: Option<Aabb>,

    /// Application-specific data
    pub extensions: BTreeMap<String, ExtensionValue>,
}

impl Default for NodeProperties {
    fn default() -> Self {
        Self {
            schema_version: PROPERTIES_SCHEMA_VERSION,
            physics: false,
            mesh_ids: Vec::new(),
            camera: None,
            aabb: None,
            extensions: BTreeMap::new(),
        }
    }
}

/// A positioned entity in a world's scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,

    /// Display name, not unique
    pub name: String,

    pub node_type: NodeType,

    /// None only for the world's root node. When creating a node, None
    /// means "attach to root".
    pub parent: Option<NodeId>,

    /// Derived by the server from the other nodes' `parent` fields
    pub children: BTreeSet<NodeId>,

    /// Homogeneous transform relative to the parent
    pub transform: Matrix4<f64>,

    /// Assigned by the server on every committed mutation
    pub last_update: Timestamp,

    pub properties: NodeProperties,
}

impl Node {
    /// Creates a node with a fresh id and identity transform.
    pub fn new(name: impl Into<String>, node_type: NodeType) -> Self {
        Self::with_id(NodeId::generate(), name, node_type)
    }

    pub fn with_id(id: NodeId, name: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            id,
            name: name.into(),
            node_type,
            parent: None,
            children: BTreeSet::new(),
            transform: Matrix4::identity(),
            last_update: Timestamp::ZERO,
            properties: NodeProperties::default(),
        }
    }

    /// Creates a world root node.
    pub fn root(id: NodeId) -> Self {
        Self::with_id(id, ROOT_NAME, NodeType::Entity)
    }

    pub fn entity(name: impl Into<String>) -> Self {
        Self::new(name, NodeType::Entity)
    }

    pub fn mesh(name: impl Into<String>, mesh_ids: Vec<MeshId>) -> Self {
        let mut node = Self::new(name, NodeType::Mesh);
        node.properties.mesh_ids = mesh_ids;
        node
    }

    pub fn camera(name: impl Into<String>, intrinsics: CameraIntrinsics) -> Self {
        let mut node = Self::new(name, NodeType::Camera);
        node.properties.camera = Some(intrinsics);
        node
    }

    /// Sets the parent (builder style).
    pub fn with_parent(mut self, parent: NodeId) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Applies a translation, expressed in the parent frame.
    pub fn translate(&mut self, offset: Vector3<f64>) {
        self.transform = Matrix4::new_translation(&offset) * self.transform;
    }

    /// Position of the node's origin in the parent frame.
    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(
            self.transform[(0, 3)],
            self.transform[(1, 3)],
            self.transform[(2, 3)],
        )
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.name.is_empty() {
            write!(f, "{} ({})", self.id, self.node_type)
        } else {
            f.write_str(&self.name)
        }
    }
}

/// Generic situation type tag.
pub const GENERIC_SITUATION: &str = "generic";

/// Owner of situations that do not name one.
pub const DEFAULT_OWNER: &str = "SYSTEM";

/// A timestamped interval (or instantaneous event) on a world's timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Situation {
    pub id: SituationId,

    /// Free-form type tag
    pub situation_type: String,

    /// Asserting agent
    pub owner: String,

    pub start: Timestamp,

    /// None while the situation is ongoing. Events have `end == Some(start)`.
    pub end: Option<Timestamp>,

    /// Assigned by the server on every committed mutation
    pub last_update: Timestamp,
}

impl Situation {
    /// Creates an ongoing situation started at `start`.
    pub fn new(situation_type: impl Into<String>, start: Timestamp) -> Self {
        Self {
            id: SituationId::generate(),
            situation_type: situation_type.into(),
            owner: DEFAULT_OWNER.to_string(),
            start,
            end: None,
            last_update: Timestamp::ZERO,
        }
    }

    /// Creates an instantaneous event.
    pub fn event(situation_type: impl Into<String>, at: Timestamp) -> Self {
        let mut situation = Self::new(situation_type, at);
        situation.end = Some(at);
        situation
    }

    pub fn with_id(mut self, id: SituationId) -> Self {
        self.id = id;
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// A situation is active iff it has started and not ended.
    pub fn is_active(&self) -> bool {
        self.end.is_none()
    }

    pub fn is_event(&self) -> bool {
        self.end == Some(self.start)
    }
}

/// Surface material of a mesh.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Material {
    /// RGBA diffuse color
    pub diffuse: [f64; 4],
}

impl Default for Material {
    fn default() -> Self {
        Self {
            diffuse: [1.0, 1.0, 1.0, 1.0],
        }
    }
}

/// Triangle mesh geometry.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Mesh {
    pub vertices: Vec<[f64; 3]>,
    /// Vertex index triples
    pub faces: Vec<[u32; 3]>,
    pub normals: Vec<[f64; 3]>,
    pub material: Material,
}

/// Strongest interaction mode a client has exhibited with a world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Reader,
    Provider,
    Monitor,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Role::Reader => "READER",
            Role::Provider => "PROVIDER",
            Role::Monitor => "MONITOR",
        };
        f.write_str(name)
    }
}

/// A client's relationship with one world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub role: Role,
    pub last_activity: Timestamp,
}

/// Topology entry for one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub links: BTreeMap<String, Link>,
}

/// Aggregate snapshot of worlds and clients, for observability tools.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub worlds: Vec<String>,
    pub clients: BTreeMap<ClientId, ClientInfo>,
}

impl Topology {
    pub fn contains_client(&self, client: &ClientId) -> bool {
        self.clients.contains_key(client)
    }

    pub fn role_of(&self, client: &ClientId, world: &str) -> Option<Role> {
        self.clients
            .get(client)
            .and_then(|info| info.links.get(world))
            .map(|link| link.role)
    }
}

/// A committed store mutation, prior to being addressed to a world.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub target: InvalidationTarget,
    pub kind: InvalidationKind,
    pub ids: Vec<String>,
}

impl Change {
    pub fn scene(kind: InvalidationKind, id: &NodeId) -> Self {
        Self {
            target: InvalidationTarget::Scene,
            kind,
            ids: vec![id.0.clone()],
        }
    }

    pub fn timeline(kind: InvalidationKind, id: &SituationId) -> Self {
        Self {
            target: InvalidationTarget::Timeline,
            kind,
            ids: vec![id.0.clone()],
        }
    }
}
