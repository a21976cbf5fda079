#![forbid(unsafe_code)]

//! Media extraction: runs yt-dlp for the video itself, then pulls the
//! advertised thumbnail over HTTP and names both files after the platform
//! identifier.

use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::metadata::Completion;

/// Prefer an mp4/m4a pair, then any single mp4, then whatever is best.
pub const VIDEO_FORMAT: &str = "bestvideo[ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best";
pub const MERGE_FORMAT: &str = "mp4";
/// Platform identifiers have a fixed length and sit at the end of the stem.
pub const IDENTIFIER_LEN: usize = 11;
const DEFAULT_THUMBNAIL_EXT: &str = ".jpg";
const MAX_THUMBNAIL_BYTES: u64 = 20 * 1024 * 1024;
const THUMBNAIL_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of a single extraction run.
#[derive(Debug, Clone)]
pub struct ExtractedMedia {
    pub title: Option<String>,
    pub video_path: PathBuf,
    pub thumbnail_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ThumbnailData {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Blocking media access. Callers on the async runtime must go through
/// `spawn_blocking`.
pub trait Fetcher: Send + Sync {
    /// Downloads the video behind `url` into `output_dir`.
    fn extract(&self, url: &str, output_dir: &Path) -> Result<ExtractedMedia>;

    fn fetch_thumbnail(&self, url: &str) -> Result<ThumbnailData>;
}

/// Subset of `yt-dlp --dump-single-json` we rely on.
#[derive(Debug, Deserialize)]
struct ExtractInfo {
    id: Option<String>,
    title: Option<String>,
    fulltitle: Option<String>,
    thumbnail: Option<String>,
    #[serde(rename = "_filename")]
    underscore_filename: Option<String>,
    filename: Option<String>,
    #[serde(default)]
    requested_downloads: Vec<RequestedDownload>,
}

#[derive(Debug, Deserialize)]
struct RequestedDownload {
    filepath: Option<String>,
}

pub struct YtDlpFetcher {
    binary: PathBuf,
    agent: ureq::Agent,
}

impl YtDlpFetcher {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            agent: ureq::AgentBuilder::new().timeout(THUMBNAIL_TIMEOUT).build(),
        }
    }
}

impl Fetcher for YtDlpFetcher {
    fn extract(&self, url: &str, output_dir: &Path) -> Result<ExtractedMedia> {
        let template = output_dir.join("%(id)s.%(ext)s");
        let output = Command::new(&self.binary)
            .arg("--format")
            .arg(VIDEO_FORMAT)
            .arg("--merge-output-format")
            .arg(MERGE_FORMAT)
            .arg("--output")
            .arg(&template)
            .arg("--no-write-thumbnail")
            .arg("--no-playlist")
            .arg("--dump-single-json")
            .arg("--no-simulate")
            .arg("--no-progress")
            .arg("--no-warnings")
            .arg("--")
            .arg(url)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("launching {}", self.binary.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "yt-dlp failed for {} ({}): {}",
                url,
                output.status,
                stderr.trim()
            );
        }

        let info: ExtractInfo =
            serde_json::from_slice(&output.stdout).context("parsing yt-dlp JSON output")?;

        let candidates: Vec<PathBuf> = info
            .requested_downloads
            .iter()
            .filter_map(|download| download.filepath.as_deref())
            .chain(info.underscore_filename.as_deref())
            .chain(info.filename.as_deref())
            .map(PathBuf::from)
            .collect();
        let video_path = locate_video_file(output_dir, &candidates, info.id.as_deref())
            .with_context(|| format!("locating downloaded file for {url}"))?;

        Ok(ExtractedMedia {
            title: info.title.or(info.fulltitle),
            video_path,
            thumbnail_url: info.thumbnail.filter(|value| !value.trim().is_empty()),
        })
    }

    fn fetch_thumbnail(&self, url: &str) -> Result<ThumbnailData> {
        let response = self
            .agent
            .get(url)
            .call()
            .with_context(|| format!("requesting thumbnail {url}"))?;
        let content_type = response.header("Content-Type").map(str::to_owned);
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_THUMBNAIL_BYTES)
            .read_to_end(&mut bytes)
            .with_context(|| format!("reading thumbnail body from {url}"))?;
        if bytes.is_empty() {
            bail!("thumbnail {url} returned an empty body");
        }
        Ok(ThumbnailData {
            bytes,
            content_type,
        })
    }
}

/// Picks the file yt-dlp actually produced. The reported name can carry the
/// pre-merge extension, so the merge container is tried as well, and as a
/// last resort the directory is scanned for `<id>.*`.
fn locate_video_file(
    output_dir: &Path,
    candidates: &[PathBuf],
    id: Option<&str>,
) -> Result<PathBuf> {
    for candidate in candidates {
        if candidate.is_file() {
            return Ok(candidate.clone());
        }
        let merged = candidate.with_extension(MERGE_FORMAT);
        if merged.is_file() {
            return Ok(merged);
        }
    }

    let id = id.ok_or_else(|| anyhow!("yt-dlp reported neither a filename nor an id"))?;
    let entries = fs::read_dir(output_dir)
        .with_context(|| format!("reading {}", output_dir.display()))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() || path.file_stem().and_then(|stem| stem.to_str()) != Some(id) {
            continue;
        }
        let ext = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");
        if matches!(ext, "part" | "ytdl" | "json" | "webp" | "jpg" | "png") {
            continue;
        }
        return Ok(path);
    }
    bail!("no downloaded file found for {id} in {}", output_dir.display())
}

/// Last [`IDENTIFIER_LEN`] characters of the file stem (the whole stem when
/// it is shorter).
pub fn identifier_from_stem(stem: &str) -> String {
    let count = stem.chars().count();
    stem.chars()
        .skip(count.saturating_sub(IDENTIFIER_LEN))
        .collect()
}

/// Chooses the thumbnail extension from the response content type, then the
/// URL path, then a `.jpg` default. The returned value includes the dot.
pub fn thumbnail_extension(content_type: Option<&str>, url: &str) -> String {
    let from_mime = content_type
        .and_then(|value| value.split(';').next())
        .map(|value| value.trim().to_ascii_lowercase())
        .and_then(|mime| match mime.as_str() {
            "image/webp" => Some(".webp"),
            "image/jpeg" | "image/jpg" => Some(".jpg"),
            "image/png" => Some(".png"),
            "image/gif" => Some(".gif"),
            _ => None,
        });
    if let Some(ext) = from_mime {
        return ext.to_string();
    }

    let from_url = url::Url::parse(url).ok().and_then(|parsed| {
        Path::new(parsed.path())
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .filter(|ext| matches!(ext.as_str(), "webp" | "jpg" | "jpeg" | "png" | "gif"))
    });
    match from_url {
        Some(ext) => format!(".{ext}"),
        None => DEFAULT_THUMBNAIL_EXT.to_string(),
    }
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

/// Runs a full extraction for `url` and lays the results out in `assets_dir`
/// as `<identifier>.<ext>` and `<identifier><thumbnail ext>`.
///
/// If the thumbnail cannot be stored the video file is removed again so a
/// failed job leaves nothing behind.
pub fn download_media(fetcher: &dyn Fetcher, url: &str, assets_dir: &Path) -> Result<Completion> {
    fs::create_dir_all(assets_dir)
        .with_context(|| format!("creating {}", assets_dir.display()))?;

    let extracted = fetcher.extract(url, assets_dir)?;
    let stem = extracted
        .video_path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .ok_or_else(|| anyhow!("downloaded file has no usable name"))?;
    let identifier = identifier_from_stem(stem);
    if !is_plain_file_name(&identifier) {
        bail!("refusing unsafe identifier {identifier:?}");
    }
    let ext = extracted
        .video_path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or(MERGE_FORMAT)
        .to_string();

    let filename = format!("{identifier}.{ext}");
    let video_path = assets_dir.join(&filename);
    if extracted.video_path != video_path {
        fs::rename(&extracted.video_path, &video_path).with_context(|| {
            format!(
                "renaming {} to {}",
                extracted.video_path.display(),
                video_path.display()
            )
        })?;
    }
    debug!(path = %video_path.display(), "video stored");

    let thumbnail = match extracted.thumbnail_url.as_deref() {
        Some(thumbnail_url) => {
            match store_thumbnail(fetcher, thumbnail_url, assets_dir, &identifier) {
                Ok(name) => Some(name),
                Err(err) => {
                    if let Err(cleanup) = fs::remove_file(&video_path) {
                        warn!(
                            path = %video_path.display(),
                            "could not remove video after thumbnail failure: {cleanup}"
                        );
                    }
                    return Err(err);
                }
            }
        }
        None => {
            warn!(url, "no thumbnail advertised");
            None
        }
    };

    Ok(Completion {
        title: extracted.title,
        filename,
        thumbnail,
        video_id: identifier,
    })
}

fn store_thumbnail(
    fetcher: &dyn Fetcher,
    thumbnail_url: &str,
    assets_dir: &Path,
    identifier: &str,
) -> Result<String> {
    let data = fetcher.fetch_thumbnail(thumbnail_url)?;
    let ext = thumbnail_extension(data.content_type.as_deref(), thumbnail_url);
    let name = format!("{identifier}{ext}");
    let path = assets_dir.join(&name);
    fs::write(&path, &data.bytes).with_context(|| format!("writing {}", path.display()))?;
    Ok(name)
}

/// Runs `<binary> --version` to fail loudly when yt-dlp is missing.
pub fn ensure_program_available(binary: &Path) -> Result<()> {
    let status = Command::new(binary)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(_) => bail!("{} is installed but returned a failure status", binary.display()),
        Err(err) => bail!("{} is not installed or not in PATH: {}", binary.display(), err),
    }
}
