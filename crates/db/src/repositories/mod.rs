pub mod lease_repo;
pub mod server_node_event_repo;
pub mod server_node_repo;

pub use lease_repo::LeaseRepo;
pub use server_node_event_repo::ServerNodeEventRepo;
pub use server_node_repo::ServerNodeRepo;
