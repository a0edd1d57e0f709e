pub mod admin;
pub mod provisioner;
pub mod supervisor;

pub use admin::{AdminChannel, PgAdminChannel};
pub use provisioner::Provisioner;
pub use supervisor::BackendSupervisor;
