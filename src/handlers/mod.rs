pub mod containers;
pub mod env;
pub mod execute;
pub mod health;
pub mod jobs;
pub mod logs;
pub mod proxy_api;
pub mod services_api;
pub mod webhook_jobs;
