mod health;
mod jobs;
mod media;
mod servers;
mod webhook;

pub use health::{healthz_handler, readyz_handler};
pub use jobs::{create_job_handler, get_job_handler, list_jobs_handler};
pub use media::serve_task_iso_handler;
pub use servers::{delete_server_handler, get_server_handler, upsert_server_handler};
pub use webhook::status_webhook_handler;
