pub mod access_keys;
pub mod apps;
pub mod deployments;
pub mod health;
pub mod releases;
pub mod report_status;
pub mod update_check;
