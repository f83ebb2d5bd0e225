//! Remote source locator.
//!
//! Turns a service identifier and a run's logical date into the release-asset
//! URL to download and the file name it is stored under. Templates are
//! rendered eagerly and fail with a [`ConfigError`] before any I/O happens.
//!
//! Placeholders:
//! - `{service}`: the service identifier (`green`, `yellow`, ...)
//! - `{ds}`: logical date as `YYYY-MM-DD`
//! - `{logical_date}`: same as `{ds}`
//! - `{logical_date:FMT}`: logical date rendered with strftime `FMT`
//! - `{{` and `}}`: literal braces

use std::fmt::Write as _;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Utc};

use crate::config::ConfigError;

/// Scheme prefix accepted (and removed) on bucket names.
pub const BUCKET_SCHEME: &str = "gs://";

/// Default release-asset endpoint for NYC TLC trip data.
pub const DEFAULT_ENDPOINT: &str = "https://github.com/DataTalksClub/nyc-tlc-data/releases/download/";

/// Default destination file template.
pub const DEFAULT_DESTINATION_TEMPLATE: &str = "{service}_tripdata_{logical_date:%Y-%m}.csv.gz";

/// Strip leading path separators from a destination path.
///
/// Idempotent: an already-relative path is returned unchanged.
pub fn normalize_destination_path(path: &str) -> String {
    path.trim_start_matches('/').to_string()
}

/// Remove a `gs://` scheme prefix and surrounding separators from a bucket name.
pub fn normalize_bucket_name(name: &str) -> String {
    let name = name.strip_prefix(BUCKET_SCHEME).unwrap_or(name);
    name.trim_matches('/').to_string()
}

/// Normalize a bucket name and reject values that cannot name a bucket.
pub fn validate_bucket_name(name: &str) -> Result<String, ConfigError> {
    let bucket = normalize_bucket_name(name.trim());
    if bucket.is_empty() {
        return Err(ConfigError::InvalidBucket {
            bucket: name.to_string(),
            reason: "bucket name is empty".into(),
        });
    }
    if bucket.contains('/') {
        return Err(ConfigError::InvalidBucket {
            bucket: name.to_string(),
            reason: "bucket name must not contain '/'".into(),
        });
    }
    Ok(bucket)
}

/// Render a placeholder template for one service and logical date.
pub fn render_template(
    template: &str,
    service: &str,
    logical_date: DateTime<Utc>,
) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(template.len() + 16);
    let mut rest = template;

    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if let Some(after) = tail.strip_prefix("{{") {
            out.push('{');
            rest = after;
        } else if let Some(after) = tail.strip_prefix("}}") {
            out.push('}');
            rest = after;
        } else if tail.starts_with('}') {
            return Err(template_error(template, "unmatched '}'"));
        } else {
            let end = tail
                .find('}')
                .ok_or_else(|| template_error(template, "unclosed '{'"))?;
            let placeholder = &tail[1..end];
            expand_placeholder(template, placeholder, service, logical_date, &mut out)?;
            rest = &tail[end + 1..];
        }
    }

    out.push_str(rest);
    Ok(out)
}

fn expand_placeholder(
    template: &str,
    placeholder: &str,
    service: &str,
    logical_date: DateTime<Utc>,
    out: &mut String,
) -> Result<(), ConfigError> {
    let (name, format) = match placeholder.split_once(':') {
        Some((name, format)) => (name.trim(), Some(format)),
        None => (placeholder.trim(), None),
    };

    match (name, format) {
        ("service", None) => out.push_str(service),
        ("ds", None) | ("logical_date", None) => {
            let _ = write!(out, "{}", logical_date.format("%Y-%m-%d"));
        }
        ("logical_date", Some(format)) => {
            let items: Vec<Item<'_>> = StrftimeItems::new(format).collect();
            if items.is_empty() || items.iter().any(|item| matches!(item, Item::Error)) {
                return Err(template_error(
                    template,
                    &format!("invalid date format '{format}'"),
                ));
            }
            write!(out, "{}", logical_date.format_with_items(items.into_iter())).map_err(|_| {
                template_error(template, &format!("date format '{format}' cannot be rendered"))
            })?;
        }
        _ => {
            return Err(template_error(
                template,
                &format!("unknown placeholder '{{{placeholder}}}'"),
            ))
        }
    }
    Ok(())
}

fn template_error(template: &str, reason: &str) -> ConfigError {
    ConfigError::Template {
        template: template.to_string(),
        reason: reason.to_string(),
    }
}

/// Where one run's artifact comes from and what it is called locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    /// Fully qualified download URL.
    pub url: String,
    /// Normalized destination path (still carrying the compression suffix).
    pub file_name: String,
}

/// Builds source URLs and destination names from templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocator {
    endpoint: String,
    service: String,
    destination_template: String,
}

impl SourceLocator {
    /// Create a locator, rejecting an empty service or endpoint.
    ///
    /// The destination template is checked by rendering it once, so a
    /// malformed template fails here rather than on the first run.
    pub fn new(
        endpoint: impl Into<String>,
        service: impl Into<String>,
        destination_template: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let endpoint = endpoint.into();
        let service = service.into();
        let destination_template = destination_template.into();

        if service.trim().is_empty() {
            return Err(ConfigError::EmptyService);
        }
        if service.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "service '{service}' must not contain '/'"
            )));
        }
        if endpoint.trim().is_empty() {
            return Err(ConfigError::MissingValue {
                key: "source.endpoint".into(),
            });
        }

        render_template(&destination_template, &service, DateTime::<Utc>::default())?;

        Ok(Self {
            endpoint,
            service,
            destination_template,
        })
    }

    /// Locator with the default endpoint and destination template.
    pub fn for_service(service: impl Into<String>) -> Result<Self, ConfigError> {
        Self::new(DEFAULT_ENDPOINT, service, DEFAULT_DESTINATION_TEMPLATE)
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Resolve the source URL and normalized file name for a logical date.
    pub fn locate(&self, logical_date: DateTime<Utc>) -> Result<SourceLocation, ConfigError> {
        let rendered = render_template(&self.destination_template, &self.service, logical_date)?;
        let file_name = normalize_destination_path(&rendered);
        if file_name.is_empty() {
            return Err(template_error(
                &self.destination_template,
                "renders to an empty destination path",
            ));
        }

        let endpoint = render_template(&self.endpoint, &self.service, logical_date)?;
        let url = format!(
            "{}/{}/{}",
            endpoint.trim_end_matches('/'),
            self.service,
            file_name
        );

        Ok(SourceLocation { url, file_name })
    }
}
