use anyhow::Result;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// The surface the client runs inside. In a browser these are a page
/// reload, a top-level navigation and a history replace.
pub trait HostController: Send + Sync {
    fn reload(&self) -> Result<()>;
    fn navigate(&self, url: &str) -> Result<()>;
    fn replace_address(&self, url: &str) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct ConsoleHost;

impl HostController for ConsoleHost {
    fn reload(&self) -> Result<()> {
        info!("reload requested");
        Ok(())
    }

    fn navigate(&self, url: &str) -> Result<()> {
        info!(url, "navigation requested");
        println!("Open {url} in your browser to continue.");
        Ok(())
    }

    fn replace_address(&self, url: &str) -> Result<()> {
        debug!(url, "address replaced");
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordingHost {
    events: Arc<Mutex<Vec<String>>>,
}

impl RecordingHost {
    pub fn events(&self) -> Vec<String> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl HostController for RecordingHost {
    fn reload(&self) -> Result<()> {
        self.lock().push("reload".to_string());
        Ok(())
    }

    fn navigate(&self, url: &str) -> Result<()> {
        self.lock().push(format!("navigate:{url}"));
        Ok(())
    }

    fn replace_address(&self, url: &str) -> Result<()> {
        self.lock().push(format!("replace:{url}"));
        Ok(())
    }
}
