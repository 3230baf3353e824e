//! Node and publisher registry.
//!
//! Maps the names used in `mimir.daemon.*` properties to constructors. The
//! registry is built once at startup and handed to [`build_runtime`], which
//! assembles the caching node and starts the configured publishers.

use futures::future::BoxFuture;
use mimir_core::properties::keys;
use mimir_core::{AnyNode, CachingNode, Error, FileNode, FileNodeConfig, Properties, Result, SystemNode};
use mimir_publisher::{
    GroupConfig, GroupNode, GroupPublisher, HttpNode, HttpNodeConfig, HttpPublisher, Publisher,
    PublisherConfig, SocketPublisher,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Default system node name
pub const DEFAULT_SYSTEM_NODE: &str = "file";

/// Builds a node from the effective properties
pub type NodeFactory = fn(&Properties) -> Result<AnyNode>;

/// Starts a publisher serving entries of the system node
pub type PublisherFactory =
    fn(&Properties, Arc<dyn SystemNode>) -> BoxFuture<'static, Result<Arc<dyn Publisher>>>;

/// Registry of node and publisher constructors
#[derive(Clone, Default)]
pub struct NodeRegistry {
    nodes: BTreeMap<String, NodeFactory>,
    publishers: BTreeMap<String, PublisherFactory>,
}

impl NodeRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in nodes (`file`, `bundle`, `http`, `group`)
    /// and publishers (`socket`, `http`, `group`).
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_node("file", file_node);
        registry.register_node("bundle", bundle_node);
        registry.register_node("http", http_node);
        registry.register_node("group", group_node);
        registry.register_publisher("socket", socket_publisher);
        registry.register_publisher("http", http_publisher);
        registry.register_publisher("group", group_publisher);
        registry
    }

    /// Register a node constructor, replacing any previous one.
    pub fn register_node(&mut self, name: impl Into<String>, factory: NodeFactory) {
        self.nodes.insert(name.into(), factory);
    }

    /// Register a publisher constructor, replacing any previous one.
    pub fn register_publisher(&mut self, name: impl Into<String>, factory: PublisherFactory) {
        self.publishers.insert(name.into(), factory);
    }

    /// Build the node registered as `name`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unknown names, or the constructor's error.
    pub fn create_node(&self, name: &str, properties: &Properties) -> Result<AnyNode> {
        let factory = self.nodes.get(name).ok_or_else(|| {
            Error::configuration(format!(
                "unknown node '{name}', known nodes: {}",
                self.nodes.keys().cloned().collect::<Vec<_>>().join(", ")
            ))
        })?;
        factory(properties)
    }

    /// Start the publisher registered as `name`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unknown names, or the constructor's error.
    pub async fn create_publisher(
        &self,
        name: &str,
        properties: &Properties,
        system: Arc<dyn SystemNode>,
    ) -> Result<Arc<dyn Publisher>> {
        let factory = self.publishers.get(name).ok_or_else(|| {
            Error::configuration(format!(
                "unknown publisher '{name}', known publishers: {}",
                self.publishers.keys().cloned().collect::<Vec<_>>().join(", ")
            ))
        })?;
        factory(properties, system).await
    }
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("publishers", &self.publishers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Everything the daemon serves from
pub struct Runtime {
    /// The cache-resolution engine
    pub caching: Arc<CachingNode>,
    /// Started publishers
    pub publishers: Vec<Arc<dyn Publisher>>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("caching", &self.caching)
            .field(
                "publishers",
                &self.publishers.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Assemble the caching node and start publishers as configured.
///
/// # Errors
///
/// Returns a configuration error when a name is unknown or a node does not
/// have the capability its slot needs, or the first construction error.
pub async fn build_runtime(registry: &NodeRegistry, properties: &Properties) -> Result<Runtime> {
    let system_name = properties.get_or(keys::DAEMON_SYSTEM_NODE, DEFAULT_SYSTEM_NODE);
    let system = registry
        .create_node(system_name, properties)?
        .into_system()
        .ok_or_else(|| mismatch(system_name, "system"))?;

    let mut locals = Vec::new();
    for name in properties.get_list(keys::DAEMON_LOCAL_NODES) {
        let node = registry.create_node(&name, properties)?;
        locals.push(node.into_local().ok_or_else(|| mismatch(&name, "local"))?);
    }

    let mut remotes = Vec::new();
    for name in properties.get_list(keys::DAEMON_REMOTE_NODES) {
        let node = registry.create_node(&name, properties)?;
        remotes.push(node.into_remote().ok_or_else(|| mismatch(&name, "remote"))?);
    }

    let mut publishers: Vec<Arc<dyn Publisher>> = Vec::new();
    for name in properties.get_list(keys::DAEMON_PUBLISHERS) {
        match registry
            .create_publisher(&name, properties, Arc::clone(&system))
            .await
        {
            Ok(publisher) => publishers.push(publisher),
            Err(e) => {
                for started in &publishers {
                    if let Err(close) = started.close().await {
                        tracing::warn!(publisher = started.name(), error = %close, "Failed to close publisher");
                    }
                }
                return Err(e);
            }
        }
    }

    Ok(Runtime {
        caching: Arc::new(CachingNode::new(locals, system, remotes)),
        publishers,
    })
}

fn mismatch(name: &str, slot: &str) -> Error {
    Error::configuration(format!("node '{name}' cannot be used as a {slot} node"))
}

// ============================================================================
// Built-in constructors
// ============================================================================

fn file_node(properties: &Properties) -> Result<AnyNode> {
    let node = FileNode::new(FileNodeConfig::system(properties)?)?;
    Ok(AnyNode::System(Arc::new(node)))
}

fn bundle_node(properties: &Properties) -> Result<AnyNode> {
    let node = FileNode::new(FileNodeConfig::bundle(properties)?)?;
    Ok(AnyNode::Local(Arc::new(node)))
}

fn http_node(properties: &Properties) -> Result<AnyNode> {
    let node = HttpNode::new(HttpNodeConfig::from_properties(properties)?)?;
    Ok(AnyNode::Remote(Arc::new(node)))
}

fn group_node(properties: &Properties) -> Result<AnyNode> {
    let node = GroupNode::new(GroupConfig::from_properties(properties)?);
    Ok(AnyNode::Remote(Arc::new(node)))
}

fn socket_publisher(
    properties: &Properties,
    system: Arc<dyn SystemNode>,
) -> BoxFuture<'static, Result<Arc<dyn Publisher>>> {
    let config = PublisherConfig::socket(properties);
    Box::pin(async move {
        let publisher = SocketPublisher::start(system, config?).await?;
        Ok(Arc::new(publisher) as Arc<dyn Publisher>)
    })
}

fn http_publisher(
    properties: &Properties,
    system: Arc<dyn SystemNode>,
) -> BoxFuture<'static, Result<Arc<dyn Publisher>>> {
    let config = PublisherConfig::http(properties);
    Box::pin(async move {
        let publisher = HttpPublisher::start(system, config?).await?;
        Ok(Arc::new(publisher) as Arc<dyn Publisher>)
    })
}

fn group_publisher(
    properties: &Properties,
    system: Arc<dyn SystemNode>,
) -> BoxFuture<'static, Result<Arc<dyn Publisher>>> {
    let side_channel = PublisherConfig::socket(properties);
    let group = GroupConfig::from_properties(properties);
    Box::pin(async move {
        let side_channel = SocketPublisher::start(system, side_channel?).await?;
        let publisher = GroupPublisher::start(Arc::new(side_channel), &group?.bind_address).await?;
        Ok(Arc::new(publisher) as Arc<dyn Publisher>)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mimir_core::Node;
    use tempfile::TempDir;

    fn props(tmp: &TempDir) -> Properties {
        Properties::new().with(keys::BASEDIR, tmp.path().to_string_lossy())
    }

    #[tokio::test]
    async fn test_default_runtime_has_file_system_node() {
        let tmp = TempDir::new().unwrap();
        let runtime = build_runtime(&NodeRegistry::with_defaults(), &props(&tmp))
            .await
            .unwrap();
        assert_eq!(runtime.caching.system().name(), "file");
        assert!(runtime.publishers.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_names_are_configuration_errors() {
        let tmp = TempDir::new().unwrap();
        let properties = props(&tmp).with(keys::DAEMON_REMOTE_NODES, "s3");
        let err = build_runtime(&NodeRegistry::with_defaults(), &properties)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_capability_mismatch_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let properties = props(&tmp)
            .with(keys::DAEMON_SYSTEM_NODE, "bundle")
            .with(keys::BUNDLE_BASEDIR, tmp.path().join("bundle").to_string_lossy());
        let err = build_runtime(&NodeRegistry::with_defaults(), &properties)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("system node"), "{err}");
    }

    #[tokio::test]
    async fn test_publishers_are_started() {
        let tmp = TempDir::new().unwrap();
        let properties = props(&tmp)
            .with(keys::DAEMON_PUBLISHERS, "socket, http")
            .with(keys::PUBLISHER_SOCKET_BIND_ADDRESS, "127.0.0.1:0")
            .with(keys::PUBLISHER_HTTP_BIND_ADDRESS, "127.0.0.1:0");
        let runtime = build_runtime(&NodeRegistry::with_defaults(), &properties)
            .await
            .unwrap();
        let names: Vec<_> = runtime.publishers.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["socket", "http"]);
        for publisher in &runtime.publishers {
            publisher.close().await.unwrap();
        }
    }
}
