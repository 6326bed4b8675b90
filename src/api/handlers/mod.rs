//! API request handlers.

pub mod display;
pub mod health;
pub mod snapshots;
pub mod vm;

use std::sync::Arc;

use crate::api::error::ApiError;
use crate::vm::VmService;

/// Run record-store and process-table work on the blocking pool.
pub(crate) async fn blocking<T, F>(service: &Arc<VmService>, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&VmService) -> crate::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let service = service.clone();
    Ok(tokio::task::spawn_blocking(move || f(&service)).await??)
}
