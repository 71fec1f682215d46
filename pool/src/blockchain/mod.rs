/// Blockchain communication module
/// Node RPC, block templates and the polling loop that feeds the dispatcher

pub mod rpc_client;
pub mod template;
pub mod template_manager;

pub use rpc_client::{NodeClient, NodeRpcClient};
pub use template::BlockTemplate;
pub use template_manager::TemplateManager;
