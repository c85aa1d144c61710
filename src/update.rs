//! Background update check against GitHub releases, cached on disk.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};

const REPO: &str = "sotto-voce/sotto";
const CACHE_FILE: &str = "update_check.json";
const CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Debug)]
pub struct Release {
    pub version: String,
    pub asset_url: String,
}

impl Release {
    /// Tag comparison on numeric components; anything unparseable loses.
    fn newer_than(&self, current: &str) -> bool {
        version_key(&self.version) > version_key(current)
    }
}

fn version_key(v: &str) -> (u64, u64, u64) {
    let mut parts = v.trim_start_matches('v').split('.');
    let mut next = || {
        parts
            .next()
            .and_then(|p| p.parse::<u64>().ok())
            .unwrap_or(0)
    };
    (next(), next(), next())
}

#[derive(Deserialize)]
struct GhRelease {
    tag_name: String,
    #[serde(default)]
    assets: Vec<GhAsset>,
}

#[derive(Deserialize)]
struct GhAsset {
    name: String,
    browser_download_url: String,
}

#[derive(Serialize, Deserialize, Default)]
struct CachedCheck {
    version: String,
    asset_url: String,
    checked_at: i64,
}

fn asset_name() -> String {
    format!("sotto_{}_{}", std::env::consts::OS, std::env::consts::ARCH)
}

async fn check_latest(current_version: &str) -> Result<Option<Release>> {
    if current_version == "dev" {
        return Ok(None);
    }

    let url = format!("https://api.github.com/repos/{REPO}/releases/latest");
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .user_agent(format!("sotto/{current_version}"))
        .build()
        .context("building update client")?;

    let response = client
        .get(&url)
        .header("Accept", "application/vnd.github+json")
        .send()
        .await
        .context("querying github releases")?;
    if !response.status().is_success() {
        return Err(anyhow!("github api: {}", response.status()));
    }

    let release: GhRelease = response.json().await.context("parsing release json")?;
    let want = asset_name();
    let asset_url = release
        .assets
        .iter()
        .find(|a| a.name == want)
        .map(|a| a.browser_download_url.clone())
        .ok_or_else(|| anyhow!("no asset {want:?} in release {}", release.tag_name))?;

    let candidate = Release {
        version: release.tag_name,
        asset_url,
    };
    if candidate.newer_than(current_version) {
        Ok(Some(candidate))
    } else {
        Ok(None)
    }
}

fn cache_path(cache_dir: &Path) -> PathBuf {
    cache_dir.join(CACHE_FILE)
}

fn read_cache(cache_dir: &Path) -> Option<Option<Release>> {
    let data = std::fs::read(cache_path(cache_dir)).ok()?;
    let cached: CachedCheck = serde_json::from_slice(&data).ok()?;
    let age = chrono::Utc::now().timestamp() - cached.checked_at;
    if age < 0 || age as u64 > CACHE_TTL.as_secs() {
        return None;
    }
    if cached.version.is_empty() {
        // A cached "no update available".
        return Some(None);
    }
    Some(Some(Release {
        version: cached.version,
        asset_url: cached.asset_url,
    }))
}

fn write_cache(cache_dir: &Path, release: Option<&Release>) {
    let cached = CachedCheck {
        version: release.map(|r| r.version.clone()).unwrap_or_default(),
        asset_url: release.map(|r| r.asset_url.clone()).unwrap_or_default(),
        checked_at: chrono::Utc::now().timestamp(),
    };
    if let Ok(data) = serde_json::to_vec(&cached) {
        let _ = std::fs::create_dir_all(cache_dir);
        let _ = std::fs::write(cache_path(cache_dir), data);
    }
}

pub async fn check_latest_cached(
    current_version: &str,
    cache_dir: &Path,
) -> Result<Option<Release>> {
    if current_version == "dev" {
        return Ok(None);
    }
    if let Some(cached) = read_cache(cache_dir) {
        return Ok(cached);
    }
    let release = check_latest(current_version).await?;
    write_cache(cache_dir, release.as_ref());
    Ok(release)
}

/// Periodic background check; `notify` fires once per discovered release.
pub fn start_background_check<F>(current_version: String, cache_dir: PathBuf, notify: F)
where
    F: Fn(&Release) + Send + 'static,
{
    if current_version == "dev" {
        return;
    }
    tokio::spawn(async move {
        let mut announced = String::new();
        loop {
            match check_latest_cached(&current_version, &cache_dir).await {
                Ok(Some(release)) if release.version != announced => {
                    info!("update_available: {}", release.version);
                    announced = release.version.clone();
                    notify(&release);
                }
                Ok(_) => {}
                Err(e) => debug!("update check failed: {}", e),
            }
            tokio::time::sleep(CHECK_INTERVAL).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ordering_handles_tags() {
        let rel = |v: &str| Release {
            version: v.into(),
            asset_url: String::new(),
        };
        assert!(rel("v0.5.0").newer_than("0.4.2"));
        assert!(rel("1.0.0").newer_than("v0.9.9"));
        assert!(!rel("v0.4.2").newer_than("0.4.2"));
        assert!(!rel("garbage").newer_than("0.0.1"));
    }

    #[test]
    fn cache_round_trip_respects_ttl() {
        let dir = std::env::temp_dir().join(format!("sotto-update-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);

        assert!(read_cache(&dir).is_none());
        let release = Release {
            version: "v9.9.9".into(),
            asset_url: "https://example.com/sotto".into(),
        };
        write_cache(&dir, Some(&release));
        let cached = read_cache(&dir).expect("fresh cache").expect("release");
        assert_eq!(cached.version, "v9.9.9");

        // A cached negative result is also honored.
        write_cache(&dir, None);
        assert!(read_cache(&dir).expect("fresh cache").is_none());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
