use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::engine::{Engine, EngineConfig};
use crate::images::ImageStore;
use crate::limits::*;
use crate::mailer::Mailer;
use crate::notify::NotifyHub;
use crate::reaper;

/// Settings shared by every site.
#[derive(Debug, Clone, Copy)]
pub struct SiteSettings {
    pub engine: EngineConfig,
    /// WAL appends before the compactor rewrites the log.
    pub compact_threshold: u64,
}

/// Manages per-site engines. Each site gets its own Engine, WAL, image
/// directory and reaper. Site = database name from the pgwire connection.
pub struct SiteManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    settings: SiteSettings,
    mailer: Arc<dyn Mailer>,
}

fn valid_site_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-'
}

/// A site name doubles as a file name, so it must not need escaping. Names
/// that would map to the same file (`hotel.a` and `hotela`) are refused
/// rather than merged.
fn check_site_name(site: &str) -> std::io::Result<()> {
    let invalid = |msg: &str| std::io::Error::new(std::io::ErrorKind::InvalidInput, msg.to_string());
    if site.len() > MAX_SITE_NAME_LEN {
        return Err(invalid("site name too long"));
    }
    if site.is_empty() {
        return Err(invalid("empty site name"));
    }
    if !site.chars().all(valid_site_char) {
        return Err(invalid("site name may only hold letters, digits, '_' and '-'"));
    }
    Ok(())
}

impl SiteManager {
    pub fn new(data_dir: PathBuf, settings: SiteSettings, mailer: Arc<dyn Mailer>) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            settings,
            mailer,
        }
    }

    /// Get or lazily create the engine for a site.
    pub fn get_or_create(&self, site: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(site) {
            return Ok(engine.value().clone());
        }
        check_site_name(site)?;
        if self.engines.len() >= MAX_SITES {
            return Err(std::io::Error::other("too many sites"));
        }

        // Two connections may race to open the same site; only one engine may own the WAL.
        let entry = self.engines.entry(site.to_string());
        if let dashmap::mapref::entry::Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }

        let wal_path = self.data_dir.join(format!("{site}.wal"));
        let images = ImageStore::open(&self.data_dir.join(format!("{site}_images")))?;
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(
            wal_path,
            images,
            notify,
            self.mailer.clone(),
            self.settings.engine,
        )?);

        let reaper_engine = engine.clone();
        tokio::spawn(async move {
            reaper::run_reaper(reaper_engine).await;
        });
        let compactor_engine = engine.clone();
        let threshold = self.settings.compact_threshold;
        tokio::spawn(async move {
            reaper::run_compactor(compactor_engine, threshold).await;
        });

        entry.or_insert(engine.clone());
        let count = self.engines.len();
        metrics::gauge!(crate::observability::SITES_ACTIVE).set(count as f64);
        info!("opened site {site} ({count} active)");
        Ok(engine)
    }
}
