// API module
//
// HTTP front end of a node: chain and pool queries, transaction
// submission, mining and routing table inspection

pub mod handlers;
pub mod routes;
pub mod schema;

// Re-export main components for easier access
pub use routes::configure_routes;
