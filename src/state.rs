use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex as AsyncMutex, Semaphore};

use crate::config::AppConfig;

pub struct AppState {
    pub limiter: Arc<Semaphore>,
    pub cookie_lock: Arc<AsyncMutex<()>>,
    // Probed once at startup; /download refuses while this is None.
    pub ffmpeg: Option<PathBuf>,
    pub config: Arc<AppConfig>,
}
