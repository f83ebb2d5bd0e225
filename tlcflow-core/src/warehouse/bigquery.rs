//! BigQuery load jobs over the REST API.
//!
//! A load is one `jobs.insert` followed by `jobs.get` polls until the job
//! reports `DONE`. A finished job with an `errorResult` is a failure.

use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::Url;
use serde::Deserialize;
use serde_json::json;

use super::{LoadError, LoadReport, LoadRequest, WarehouseLoader};

pub const DEFAULT_BASE_URL: &str = "https://bigquery.googleapis.com";

pub struct BigQueryLoader {
    client: Client,
    base_url: String,
    token: Option<String>,
    location: Option<String>,
    poll_interval: Duration,
    max_polls: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Job {
    job_reference: JobReference,
    status: JobStatus,
    #[serde(default)]
    statistics: Option<JobStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    state: String,
    #[serde(default)]
    error_result: Option<ErrorProto>,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobStatistics {
    #[serde(default)]
    load: Option<LoadStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadStatistics {
    #[serde(default)]
    output_rows: Option<String>,
}

impl BigQueryLoader {
    pub fn new(token: Option<String>, timeout: Duration) -> Result<Self, LoadError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tlcflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(LoadError::Network)?;
        Ok(Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            token,
            location: None,
            poll_interval: Duration::from_secs(5),
            max_polls: 120,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_location(mut self, location: Option<String>) -> Self {
        self.location = location;
        self
    }

    pub fn with_polling(mut self, interval: Duration, max_polls: u32) -> Self {
        self.poll_interval = interval;
        self.max_polls = max_polls.max(1);
        self
    }

    fn url(&self, segments: &[&str]) -> Result<Url, LoadError> {
        let invalid = || LoadError::Response(format!("invalid base URL '{}'", self.base_url));
        let mut url = Url::parse(&self.base_url).map_err(|_| invalid())?;
        url.path_segments_mut()
            .map_err(|_| invalid())?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn send(&self, req: RequestBuilder) -> Result<Response, LoadError> {
        let req = match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        };
        req.send().map_err(LoadError::Network)
    }

    fn job_body(&self, project: &str, request: &LoadRequest) -> serde_json::Value {
        let bucket = crate::locator::normalize_bucket_name(&request.bucket);
        let uris: Vec<String> = request
            .source_objects
            .iter()
            .map(|key| format!("gs://{bucket}/{key}"))
            .collect();
        let mut reference = json!({ "projectId": project });
        if let Some(location) = &self.location {
            reference["location"] = json!(location);
        }
        json!({
            "jobReference": reference,
            "configuration": {
                "load": {
                    "sourceUris": uris,
                    "sourceFormat": "CSV",
                    "skipLeadingRows": request.skip_leading_rows,
                    "writeDisposition": request.write_disposition.as_bigquery(),
                    "destinationTable": {
                        "projectId": project,
                        "datasetId": request.destination.dataset,
                        "tableId": request.destination.table,
                    },
                    "schema": { "fields": request.schema.fields },
                }
            }
        })
    }

    fn read_job(resp: Response) -> Result<Job, LoadError> {
        let status = resp.status();
        if !status.is_success() {
            return Err(LoadError::JobRejected {
                status: status.as_u16(),
                detail: resp.text().unwrap_or_default(),
            });
        }
        resp.json::<Job>()
            .map_err(|e| LoadError::Response(e.to_string()))
    }

    fn finish(job: Job, destination: String) -> Result<LoadReport, LoadError> {
        if let Some(err) = job.status.error_result {
            let reason = match (err.reason, err.message) {
                (Some(r), Some(m)) => format!("{r}: {m}"),
                (Some(r), None) => r,
                (None, Some(m)) => m,
                (None, None) => "unknown error".to_string(),
            };
            return Err(LoadError::JobFailed {
                job_id: job.job_reference.job_id,
                reason,
            });
        }
        let rows_loaded = job
            .statistics
            .and_then(|s| s.load)
            .and_then(|l| l.output_rows)
            .map(|rows| {
                rows.parse::<u64>()
                    .map_err(|_| LoadError::Response(format!("bad outputRows '{rows}'")))
            })
            .transpose()?
            .unwrap_or(0);
        Ok(LoadReport {
            destination,
            rows_loaded,
            job_id: job.job_reference.job_id,
        })
    }
}

impl WarehouseLoader for BigQueryLoader {
    fn name(&self) -> &str {
        "bigquery"
    }

    fn load(&self, request: &LoadRequest) -> Result<LoadReport, LoadError> {
        let project = request
            .destination
            .project
            .as_deref()
            .ok_or(LoadError::MissingProject)?;
        let destination = request.destination.to_string();

        let url = self.url(&["bigquery", "v2", "projects", project, "jobs"])?;
        let mut job = Self::read_job(
            self.send(self.client.post(url).json(&self.job_body(project, request)))?,
        )?;
        tracing::info!(
            job_id = %job.job_reference.job_id,
            table = %destination,
            "submitted load job"
        );

        let mut polls = 0;
        while job.status.state != "DONE" {
            if polls >= self.max_polls {
                return Err(LoadError::JobTimeout {
                    job_id: job.job_reference.job_id,
                    polls,
                });
            }
            thread::sleep(self.poll_interval);
            polls += 1;

            let url = self.url(&[
                "bigquery",
                "v2",
                "projects",
                project,
                "jobs",
                &job.job_reference.job_id,
            ])?;
            let mut req = self.client.get(url);
            if let Some(location) = job.job_reference.location.as_ref().or(self.location.as_ref()) {
                req = req.query(&[("location", location)]);
            }
            job = Self::read_job(self.send(req)?)?;
            tracing::debug!(
                job_id = %job.job_reference.job_id,
                state = %job.status.state,
                polls,
                "polled load job"
            );
        }

        Self::finish(job, destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::{TableRef, TableSchema};
    use mockito::Matcher;

    fn loader(server: &mockito::Server, max_polls: u32) -> BigQueryLoader {
        BigQueryLoader::new(Some("tok".into()), Duration::from_secs(5))
            .unwrap()
            .with_base_url(server.url())
            .with_polling(Duration::from_millis(0), max_polls)
    }

    fn request() -> LoadRequest {
        LoadRequest::append_csv(
            "trips",
            "green/green_tripdata_2021-01.csv",
            TableRef::for_service(Some("proj".into()), "alt_data", "green"),
            TableSchema::green_trips(),
        )
    }

    const RUNNING: &str = r#"{"jobReference":{"jobId":"job_1","location":"US"},"status":{"state":"RUNNING"}}"#;

    #[test]
    fn submits_and_polls_until_done() {
        let mut server = mockito::Server::new();
        let insert = server
            .mock("POST", "/bigquery/v2/projects/proj/jobs")
            .match_header("authorization", "Bearer tok")
            .match_body(Matcher::PartialJson(json!({
                "configuration": {"load": {
                    "sourceUris": ["gs://trips/green/green_tripdata_2021-01.csv"],
                    "sourceFormat": "CSV",
                    "skipLeadingRows": 1,
                    "writeDisposition": "WRITE_APPEND",
                    "destinationTable": {"projectId": "proj", "datasetId": "alt_data", "tableId": "green_alt_data_table"}
                }}
            })))
            .with_status(200)
            .with_body(RUNNING)
            .create();
        let get = server
            .mock("GET", "/bigquery/v2/projects/proj/jobs/job_1")
            .match_query(Matcher::UrlEncoded("location".into(), "US".into()))
            .with_status(200)
            .with_body(r#"{"jobReference":{"jobId":"job_1"},"status":{"state":"DONE"},"statistics":{"load":{"outputRows":"76518"}}}"#)
            .create();

        let report = loader(&server, 5).load(&request()).unwrap();
        insert.assert();
        get.assert();
        assert_eq!(report.rows_loaded, 76518);
        assert_eq!(report.job_id, "job_1");
        assert_eq!(report.destination, "proj.alt_data.green_alt_data_table");
    }

    #[test]
    fn error_result_is_job_failed() {
        let mut server = mockito::Server::new();
        server
            .mock("POST", "/bigquery/v2/projects/proj/jobs")
            .with_status(200)
            .with_body(r#"{"jobReference":{"jobId":"job_2"},"status":{"state":"DONE","errorResult":{"reason":"invalid","message":"bad row"}}}"#)
            .create();
        let err = loader(&server, 5).load(&request()).unwrap_err();
        match err {
            LoadError::JobFailed { job_id, reason } => {
                assert_eq!(job_id, "job_2");
                assert_eq!(reason, "invalid: bad row");
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn rejected_submission() {
        let mut server = mockito::Server::new();
        server
            .mock("POST", "/bigquery/v2/projects/proj/jobs")
            .with_status(403)
            .with_body("denied")
            .create();
        assert!(matches!(
            loader(&server, 5).load(&request()).unwrap_err(),
            LoadError::JobRejected { status: 403, .. }
        ));
    }

    #[test]
    fn gives_up_after_max_polls() {
        let mut server = mockito::Server::new();
        server
            .mock("POST", "/bigquery/v2/projects/proj/jobs")
            .with_status(200)
            .with_body(RUNNING)
            .create();
        server
            .mock("GET", "/bigquery/v2/projects/proj/jobs/job_1")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(RUNNING)
            .expect(2)
            .create();
        assert!(matches!(
            loader(&server, 2).load(&request()).unwrap_err(),
            LoadError::JobTimeout { polls: 2, .. }
        ));
    }

    #[test]
    fn requires_project() {
        let server = mockito::Server::new();
        let mut req = request();
        req.destination.project = None;
        assert!(matches!(
            loader(&server, 1).load(&req).unwrap_err(),
            LoadError::MissingProject
        ));
    }
}
