pub mod status;
pub mod event;
pub mod dependents;
pub mod registry;
pub mod config;
pub mod retry;
pub mod sysfs;
pub mod clock_id;
pub mod traits;
pub mod netlink;
pub mod backend;
pub mod holdover;
pub mod monitor;
