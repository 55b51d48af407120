//! Collaborator contracts the run engine consumes, and the implementations
//! shipped with the engine.

use chrono::{DateTime, Datelike, Utc};
use std::collections::HashMap;
use std::io::{self, Read};

use crate::error::{ConfigurationError, ScanError};
use crate::fs_ops;
use crate::model::{Credentials, Destination, JobConfig, SourceItem};
use crate::transfer::join_remote;

/// Looks up a configured job.
pub trait JobResolver: Send + Sync {
    fn resolve_job(&self, job_id: &str) -> Result<JobConfig, ConfigurationError>;
}

/// Looks up the destination a job transfers to.
pub trait DestinationResolver: Send + Sync {
    fn resolve_destination(&self, job: &JobConfig) -> Result<Destination, ConfigurationError>;
}

/// Secret storage keyed by alias.
pub trait CredentialStore: Send + Sync {
    fn load_secret(&self, alias: &str) -> Option<String>;
}

/// Produces a job's items and their byte streams.
pub trait ItemSource: Send + Sync {
    /// Finite, ordered sequence of the job's items.
    fn enumerate(&self, job: &JobConfig) -> Result<Vec<SourceItem>, ScanError>;

    fn open(&self, job: &JobConfig, item: &SourceItem) -> io::Result<Box<dyn Read + Send>>;
}

/// Run-level values available to path templates.
#[derive(Debug, Clone)]
pub struct RenderContext<'a> {
    pub job: &'a JobConfig,
    pub run_started_at: DateTime<Utc>,
}

/// Pure mapping from an item to its destination path.
pub trait PathRenderer: Send + Sync {
    fn render(
        &self,
        base_path: &str,
        template: &str,
        item: &SourceItem,
        context: &RenderContext<'_>,
    ) -> String;
}

/// Resolve the credentials for a destination, failing if the secret is absent.
pub fn resolve_credentials(
    store: &dyn CredentialStore,
    destination: &Destination,
) -> Result<Credentials, ConfigurationError> {
    let secret = store
        .load_secret(&destination.credential_alias)
        .ok_or_else(|| ConfigurationError::CredentialsMissing(destination.credential_alias.clone()))?;
    Ok(Credentials {
        username: destination.username.clone(),
        secret,
    })
}

/// `{token}` template renderer.
///
/// Tokens: `{job}`, `{year}`, `{month}`, `{day}`, `{name}`, `{stem}`, `{ext}`,
/// `{dir}`, `{id}`. Dates come from the item's `taken_at`, or the run start
/// when the item has none. Unknown tokens are kept verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateRenderer;

fn sanitize_segment(value: &str) -> String {
    value
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect()
}

impl TemplateRenderer {
    fn token_value(token: &str, item: &SourceItem, context: &RenderContext<'_>) -> Option<String> {
        let date = item.taken_at.unwrap_or(context.run_started_at);
        let name = item.file_name();
        let (stem, ext) = match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem, ext),
            _ => (name, ""),
        };

        let value = match token {
            "job" => sanitize_segment(&context.job.job_id),
            "year" => format!("{:04}", date.year()),
            "month" => format!("{:02}", date.month()),
            "day" => format!("{:02}", date.day()),
            "name" => sanitize_segment(name),
            "stem" => sanitize_segment(stem),
            "ext" => sanitize_segment(ext),
            "dir" => item
                .relative_path
                .as_deref()
                .and_then(|p| p.rsplit_once('/'))
                .map(|(dir, _)| dir.to_string())
                .unwrap_or_default(),
            "id" => sanitize_segment(&item.id),
            _ => return None,
        };
        Some(value)
    }
}

impl PathRenderer for TemplateRenderer {
    fn render(
        &self,
        base_path: &str,
        template: &str,
        item: &SourceItem,
        context: &RenderContext<'_>,
    ) -> String {
        let mut rendered = String::with_capacity(template.len() + 32);
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            rendered.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find('}') {
                Some(close) => {
                    let token = &after[..close];
                    match Self::token_value(token, item, context) {
                        Some(value) => rendered.push_str(&value),
                        None => {
                            rendered.push('{');
                            rendered.push_str(token);
                            rendered.push('}');
                        }
                    }
                    rest = &after[close + 1..];
                }
                None => {
                    rendered.push_str(&rest[open..]);
                    rest = "";
                }
            }
        }
        rendered.push_str(rest);

        let relative: Vec<&str> = rendered.split('/').filter(|s| !s.is_empty()).collect();
        join_remote(base_path, &relative.join("/"))
    }
}

/// Items from a local directory tree rooted at the job's `source_root`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectorySource;

impl ItemSource for DirectorySource {
    fn enumerate(&self, job: &JobConfig) -> Result<Vec<SourceItem>, ScanError> {
        fs_ops::enumerate_tree(&job.source_root)
    }

    fn open(&self, job: &JobConfig, item: &SourceItem) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(fs_ops::open_item(&job.source_root, item)?))
    }
}

/// Secrets read from `SHARESYNC_SECRET_<ALIAS>` environment variables.
///
/// The alias is upper-cased and every character outside `[A-Z0-9]` becomes `_`.
#[derive(Debug, Clone)]
pub struct EnvCredentialStore {
    prefix: String,
}

impl Default for EnvCredentialStore {
    fn default() -> Self {
        EnvCredentialStore {
            prefix: "SHARESYNC_SECRET_".to_string(),
        }
    }
}

impl EnvCredentialStore {
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        EnvCredentialStore { prefix: prefix.into() }
    }

    pub fn variable_name(&self, alias: &str) -> String {
        let suffix: String = alias
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}", self.prefix, suffix)
    }
}

impl CredentialStore for EnvCredentialStore {
    fn load_secret(&self, alias: &str) -> Option<String> {
        std::env::var(self.variable_name(alias))
            .ok()
            .filter(|s| !s.is_empty())
    }
}

/// In-memory secrets, for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryCredentialStore {
    secrets: HashMap<String, String>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, alias: impl Into<String>, secret: impl Into<String>) -> Self {
        self.secrets.insert(alias.into(), secret.into());
        self
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load_secret(&self, alias: &str) -> Option<String> {
        self.secrets.get(alias).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::path::PathBuf;

    fn job() -> JobConfig {
        JobConfig {
            job_id: "camera".to_string(),
            name: "Camera roll".to_string(),
            source_root: PathBuf::from("/data/camera"),
            path_template: "{year}/{month}/{name}".to_string(),
            destination_id: "nas".to_string(),
        }
    }

    fn destination() -> Destination {
        Destination {
            destination_id: "nas".to_string(),
            host: "nas".to_string(),
            share: "photos".to_string(),
            base_path: "backup".to_string(),
            username: "alice".to_string(),
            credential_alias: "nas-main".to_string(),
        }
    }

    fn render(template: &str, item: &SourceItem) -> String {
        let job = job();
        let context = RenderContext {
            job: &job,
            run_started_at: Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap(),
        };
        TemplateRenderer.render("backup/", template, item, &context)
    }

    #[test]
    fn test_render_uses_taken_at() {
        let mut item = SourceItem::new("DCIM/IMG_1.jpg");
        item.relative_path = Some("DCIM/IMG_1.jpg".to_string());
        item.taken_at = Some(Utc.with_ymd_and_hms(2021, 6, 9, 12, 0, 0).unwrap());

        assert_eq!(render("{year}/{month}/{name}", &item), "backup/2021/06/IMG_1.jpg");
        assert_eq!(render("{job}/{day}/{stem}.{ext}", &item), "backup/camera/09/IMG_1.jpg");
        assert_eq!(render("{dir}/{name}", &item), "backup/DCIM/IMG_1.jpg");
    }

    #[test]
    fn test_render_falls_back_to_run_start() {
        let item = SourceItem::new("photo.png");
        assert_eq!(render("{year}-{month}-{day}/{name}", &item), "backup/2025-01-02/photo.png");
    }

    #[test]
    fn test_render_keeps_unknown_tokens_and_collapses_separators() {
        let item = SourceItem::new("a.txt");
        assert_eq!(render("{dir}/{unknown}//{name}", &item), "backup/{unknown}/a.txt");
        assert_eq!(render("{id", &item), "backup/{id");
    }

    #[test]
    fn test_render_sanitizes_ids() {
        let item = SourceItem::new("content://media/42");
        assert_eq!(render("{id}", &item), "backup/content:__media_42");
    }

    #[test]
    fn test_resolve_credentials() {
        let store = MemoryCredentialStore::new().with_secret("nas-main", "hunter2");
        let credentials = resolve_credentials(&store, &destination()).expect("credentials");
        assert_eq!(credentials.username, "alice");
        assert_eq!(credentials.secret, "hunter2");

        let err = resolve_credentials(&MemoryCredentialStore::new(), &destination())
            .err()
            .expect("missing");
        assert_eq!(err, ConfigurationError::CredentialsMissing("nas-main".to_string()));
    }

    #[test]
    fn test_env_credential_store_variable_name() {
        let store = EnvCredentialStore::with_prefix("SHARESYNC_TEST_SECRET_");
        assert_eq!(store.variable_name("nas-main"), "SHARESYNC_TEST_SECRET_NAS_MAIN");

        std::env::set_var("SHARESYNC_TEST_SECRET_ENV_STORE", "s3cret");
        assert_eq!(store.load_secret("env.store"), Some("s3cret".to_string()));
        assert_eq!(store.load_secret("absent"), None);
    }

    #[test]
    fn test_directory_source_enumerates_job_root() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        std::fs::write(temp_dir.path().join("a.jpg"), b"abc").expect("write");
        let mut job = job();
        job.source_root = temp_dir.path().to_path_buf();

        let items = DirectorySource.enumerate(&job).expect("enumerate");
        assert_eq!(items.len(), 1);
        let mut content = Vec::new();
        DirectorySource
            .open(&job, &items[0])
            .expect("open")
            .read_to_end(&mut content)
            .expect("read");
        assert_eq!(content, b"abc");
    }
}
