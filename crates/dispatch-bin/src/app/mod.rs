//! Application wiring for the dispatcher daemon and operator commands.

mod admin;
mod init;
mod state;
mod submit;

pub use admin::{
    list_features, list_routes, print_json, print_status, purge_delivered, replay, set_feature,
    set_route, status, StatusReport,
};
pub use init::run_dispatcher;
pub use state::AppContext;
pub use submit::{execute_now, submit};
