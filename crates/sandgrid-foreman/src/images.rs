//! Local container image cache and its reconciliation against the disk
//! budget.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::BoxFuture;
use crate::error::{ForemanError, ForemanResult};

pub trait ImageCache: Send + Sync + 'static {
    /// Images present locally with their size in bytes.
    fn list(&self) -> BoxFuture<'_, ForemanResult<BTreeMap<String, u64>>>;

    fn pull<'a>(&'a self, image: &'a str) -> BoxFuture<'a, ForemanResult<()>>;

    fn remove<'a>(&'a self, image: &'a str) -> BoxFuture<'a, ForemanResult<()>>;
}

/// Images of the local docker daemon.
pub struct DockerImages {
    docker: String,
}

impl DockerImages {
    pub fn new(docker: impl Into<String>) -> Self {
        Self {
            docker: docker.into(),
        }
    }

    async fn docker(&self, args: &[&str]) -> ForemanResult<String> {
        let output = Command::new(&self.docker)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ForemanError::Image(format!("{}: {e}", self.docker)))?;
        if !output.status.success() {
            return Err(ForemanError::Image(format!(
                "{} {}: {}",
                self.docker,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Parse `docker image ls --format '{{.Repository}}:{{.Tag}}'` output.
fn parse_image_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.contains("<none>"))
        .map(str::to_string)
        .collect()
}

impl ImageCache for DockerImages {
    fn list(&self) -> BoxFuture<'_, ForemanResult<BTreeMap<String, u64>>> {
        Box::pin(async move {
            let listing = self
                .docker(&["image", "ls", "--format", "{{.Repository}}:{{.Tag}}"])
                .await?;
            let mut images = BTreeMap::new();
            for image in parse_image_list(&listing) {
                let size = self
                    .docker(&["image", "inspect", "--format", "{{.Size}}", &image])
                    .await?;
                let size = size
                    .trim()
                    .parse()
                    .map_err(|_| ForemanError::Image(format!("bad size for {image}: {size:?}")))?;
                images.insert(image, size);
            }
            Ok(images)
        })
    }

    fn pull<'a>(&'a self, image: &'a str) -> BoxFuture<'a, ForemanResult<()>> {
        Box::pin(async move {
            self.docker(&["pull", "--quiet", image]).await?;
            Ok(())
        })
    }

    fn remove<'a>(&'a self, image: &'a str) -> BoxFuture<'a, ForemanResult<()>> {
        Box::pin(async move {
            self.docker(&["image", "rm", image]).await?;
            Ok(())
        })
    }
}

/// Bring the local image cache in line with the next round.
///
/// `needed` maps each image of the admitted batch to its declared size;
/// `queued` lists images of tasks still waiting locally. Needed images
/// are always kept; queued images are kept next, then the rest by how
/// recently a round needed them (`last_needed`, higher is more recent),
/// while they fit in what `budget` leaves after the needed images. All
/// other images are removed and missing needed images pulled (every
/// needed image when `pull` is set). Removal and pull failures are
/// logged and skipped.
pub async fn reconcile_images(
    cache: &dyn ImageCache,
    budget: u64,
    pull: bool,
    needed: &BTreeMap<String, u64>,
    queued: &[String],
    last_needed: &HashMap<String, u64>,
) -> ForemanResult<()> {
    let present = cache.list().await?;
    let mut free = budget.saturating_sub(needed.values().sum());

    let mut keep: BTreeSet<&str> = needed.keys().map(String::as_str).collect();
    let mut optional: Vec<&str> = Vec::new();
    for image in queued {
        if present.contains_key(image) && !optional.contains(&image.as_str()) {
            optional.push(image);
        }
    }
    let mut others: Vec<&str> = present
        .keys()
        .map(String::as_str)
        .filter(|image| !optional.contains(image))
        .collect();
    others.sort_by_key(|image| std::cmp::Reverse(last_needed.get(*image).copied().unwrap_or(0)));
    optional.extend(others);

    for image in optional {
        if keep.contains(image) {
            continue;
        }
        let size = present.get(image).copied().unwrap_or(0);
        if size <= free {
            free -= size;
            keep.insert(image);
        }
    }

    for image in present.keys() {
        if keep.contains(image.as_str()) {
            continue;
        }
        match cache.remove(image).await {
            Ok(()) => info!(%image, "image evicted"),
            Err(e) => warn!(%image, error = %e, "image eviction failed"),
        }
    }

    for image in needed.keys() {
        if pull || !present.contains_key(image) {
            debug!(%image, "pulling image");
            if let Err(e) = cache.pull(image).await {
                warn!(%image, error = %e, "image pull failed");
            }
        }
    }
    Ok(())
}
