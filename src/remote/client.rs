// ABOUTME: HTTP client for the Salesforce SOAP login, REST describe and Bulk API 2.0 query jobs
// ABOUTME: Implements BulkApi; every non-success response becomes a descriptive error

use anyhow::{bail, Context, Result};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

use super::models::{ApiError, BatchStatus, CreateQueryJob, DescribeResponse, QueryJobInfo};
use super::BulkApi;
use crate::error::ReplicationError;
use crate::schema::FieldDescriptor;

const LOCATOR_HEADER: &str = "Sforce-Locator";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Limit for login, describe and job control calls. Result downloads have none.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Authenticated session against one org.
pub struct SalesforceClient {
    client: Client,
    instance_url: String,
    session_id: String,
    api_version: String,
}

/// Raised when the login call rejects the credentials, so callers can re-prompt.
#[derive(Debug, thiserror::Error)]
#[error("Login failed: {0}")]
pub struct LoginRejected(pub String);

impl SalesforceClient {
    /// Log in with the partner SOAP API and keep the returned session.
    pub async fn login(
        endpoint: &str,
        user: &str,
        pass: &str,
        api_version: &str,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .gzip(true)
            .build()
            .context("Failed to create HTTP client")?;

        let response = client
            .post(endpoint)
            .timeout(REQUEST_TIMEOUT)
            .header(CONTENT_TYPE, "text/xml; charset=UTF-8")
            .header("SOAPAction", "login")
            .body(login_envelope(user, pass))
            .send()
            .await
            .with_context(|| format!("Failed to reach login endpoint {}", endpoint))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            let fault = extract_xml_element(&body, "faultstring").unwrap_or_else(|| body.clone());
            if status == StatusCode::INTERNAL_SERVER_ERROR || status == StatusCode::UNAUTHORIZED {
                return Err(LoginRejected(fault).into());
            }
            bail!("Login request failed with status {}: {}", status, fault);
        }

        let session_id = extract_xml_element(&body, "sessionId")
            .context("Login response did not contain a session id")?;
        let server_url = extract_xml_element(&body, "serverUrl")
            .context("Login response did not contain a server URL")?;
        let instance_url = url::Url::parse(&server_url)
            .with_context(|| format!("Invalid server URL in login response: {}", server_url))?
            .origin()
            .ascii_serialization();

        tracing::debug!("Logged in as {} on {}", user, instance_url);

        Ok(Self {
            client,
            instance_url,
            session_id,
            api_version: api_version.to_string(),
        })
    }

    pub fn instance_url(&self) -> &str {
        &self.instance_url
    }

    fn data_url(&self, path: &str) -> String {
        format!(
            "{}/services/data/v{}/{}",
            self.instance_url, self.api_version, path
        )
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.session_id)
    }

    fn control_request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .header(AUTHORIZATION, self.bearer())
            .timeout(REQUEST_TIMEOUT)
    }

    /// Result parts stream for as long as they take.
    fn results_request(&self, job_id: &str, locator: Option<&str>) -> RequestBuilder {
        let url = self.data_url(&format!("jobs/query/{}/results", job_id));
        let request = self
            .client
            .get(&url)
            .header(AUTHORIZATION, self.bearer())
            .header(ACCEPT, "text/csv");
        match locator {
            Some(locator) => request.query(&[("locator", locator)]),
            None => request,
        }
    }

    async fn describe_object(&self, object: &str) -> Result<Vec<FieldDescriptor>> {
        let url = self.data_url(&format!("sobjects/{}/describe", object));
        let response = self
            .control_request(Method::GET, &url)
            .send()
            .await
            .with_context(|| format!("Failed to send describe request for {}", object))?;

        if !response.status().is_success() {
            let message = error_message(response).await;
            return Err(ReplicationError::Describe {
                object: object.to_string(),
                message,
            }
            .into());
        }

        let describe: DescribeResponse = response
            .json()
            .await
            .with_context(|| format!("Failed to parse describe response for {}", object))?;
        Ok(describe.fields)
    }
}

impl BulkApi for SalesforceClient {
    async fn describe(&self, objects: &[String]) -> Result<HashMap<String, Vec<FieldDescriptor>>> {
        let mut described = HashMap::with_capacity(objects.len());
        for object in objects {
            let fields = self.describe_object(object).await?;
            described.insert(object.clone(), fields);
        }
        Ok(described)
    }

    async fn submit_query(&self, object: &str, query: &str) -> Result<String> {
        let url = self.data_url("jobs/query");
        let response = self
            .control_request(Method::POST, &url)
            .json(&CreateQueryJob {
                operation: "query",
                query,
            })
            .send()
            .await
            .with_context(|| format!("Failed to create query job for {}", object))?;

        if !response.status().is_success() {
            let status = response.status();
            let message = error_message(response).await;
            bail!("Query job creation for {} failed with status {}: {}", object, status, message);
        }

        let info: QueryJobInfo = response
            .json()
            .await
            .context("Failed to parse query job response")?;
        Ok(info.id)
    }

    async fn job_status(&self, job_id: &str) -> Result<BatchStatus> {
        let url = self.data_url(&format!("jobs/query/{}", job_id));
        let response = self
            .control_request(Method::GET, &url)
            .send()
            .await
            .with_context(|| format!("Failed to get status of job {}", job_id))?;

        if !response.status().is_success() {
            let status = response.status();
            let message = error_message(response).await;
            bail!("Status request for job {} failed with status {}: {}", job_id, status, message);
        }

        let info: QueryJobInfo = response
            .json()
            .await
            .context("Failed to parse job status")?;
        info.to_status()
    }

    async fn fetch_result_part(
        &self,
        job_id: &str,
        locator: Option<&str>,
        sink: &mut (dyn Write + Send),
    ) -> Result<Option<String>> {
        let mut response = self
            .results_request(job_id, locator)
            .send()
            .await
            .with_context(|| format!("Failed to fetch results of job {}", job_id))?;

        if !response.status().is_success() {
            let status = response.status();
            let message = error_message(response).await;
            bail!("Result request for job {} failed with status {}: {}", job_id, status, message);
        }

        let next = response
            .headers()
            .get(LOCATOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(next_locator);

        while let Some(chunk) = response
            .chunk()
            .await
            .with_context(|| format!("Failed to read results of job {}", job_id))?
        {
            sink.write_all(&chunk)
                .context("Failed to write result part to spool file")?;
        }
        sink.flush().context("Failed to flush spool file")?;

        Ok(next)
    }
}

/// Interpret the locator header; the API sends the literal `null` after the last part.
fn next_locator(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("null") {
        None
    } else {
        Some(value.to_string())
    }
}

async fn error_message(response: Response) -> String {
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<Vec<ApiError>>(&body) {
        Ok(errors) if !errors.is_empty() => errors
            .iter()
            .map(|e| match &e.error_code {
                Some(code) => format!("{}: {}", code, e.message),
                None => e.message.clone(),
            })
            .collect::<Vec<_>>()
            .join("; "),
        _ => body,
    }
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn login_envelope(user: &str, pass: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<env:Envelope xmlns:xsd="http://www.w3.org/2001/XMLSchema" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xmlns:env="http://schemas.xmlsoap.org/soap/envelope/">
  <env:Body>
    <n1:login xmlns:n1="urn:partner.soap.sforce.com">
      <n1:username>{}</n1:username>
      <n1:password>{}</n1:password>
    </n1:login>
  </env:Body>
</env:Envelope>"#,
        xml_escape(user),
        xml_escape(pass)
    )
}

/// Text of the first `<tag>` element, with or without a namespace prefix.
fn extract_xml_element(body: &str, tag: &str) -> Option<String> {
    let close = format!("{}>", tag);
    let mut search_from = 0;
    while let Some(found) = body[search_from..].find(&close) {
        let at = search_from + found;
        search_from = at + close.len();

        let open_start = body[..at].rfind('<')?;
        let prefix = &body[open_start + 1..at];
        if prefix.starts_with('/') || !(prefix.is_empty() || prefix.ends_with(':')) {
            continue;
        }

        let content = &body[search_from..];
        let end = content.find("</")?;
        return Some(
            content[..end]
                .replace("&lt;", "<")
                .replace("&gt;", ">")
                .replace("&quot;", "\"")
                .replace("&apos;", "'")
                .replace("&amp;", "&"),
        );
    }
    None
}
