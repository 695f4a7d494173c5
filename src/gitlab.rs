use derive_more::{Display, From};
use log::debug;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;

/// Used when no base URL is provided
const DEFAULT_BASE_URL: &str = "https://gitlab.com/api/v4";
const PER_PAGE: u32 = 100;

#[derive(Debug, From, Display)]
pub enum ClientError {
    #[from(ignore)]
    #[display(fmt = "Invalid GitLab base URL '{}'", _0)]
    InvalidBaseUrl(String),
    #[display(fmt = "HTTP error while talking to GitLab: {}", _0)]
    Http(reqwest::Error),
    #[display(fmt = "GitLab responded with status {}", _0)]
    Status(StatusCode),
}

impl std::error::Error for ClientError {}

pub type ClientResult<T> = Result<T, ClientError>;

/// A repository within a group
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Project {
    pub name: String,
    pub ssh_url_to_repo: String,
}

pub struct GitLabClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl GitLabClient {
    /// Creates a client for the API at `base_url` authenticating with
    /// the private `token`. An empty `base_url` targets gitlab.com.
    pub fn new(token: &str, base_url: &str) -> ClientResult<Self> {
        let base_url = parse_base_url(base_url)?;
        let http = Client::builder()
            .user_agent(concat!("template-pusher/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url,
            token: token.to_string(),
        })
    }

    /// Lists every project directly inside the group following the
    /// pagination headers until the last page
    pub async fn list_group_projects(&self, group_id: &str) -> ClientResult<Vec<Project>> {
        let mut projects = Vec::new();
        let mut page = Some(1);

        while let Some(current) = page {
            let url = self.projects_url(group_id, current)?;
            debug!("Listing projects from {url}");

            let response = self
                .http
                .get(url)
                .header("PRIVATE-TOKEN", &self.token)
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                return Err(ClientError::Status(status));
            }

            page = next_page(response.headers());
            let mut batch: Vec<Project> = response.json().await?;
            projects.append(&mut batch);
        }

        Ok(projects)
    }

    fn projects_url(&self, group_id: &str, page: u32) -> ClientResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::InvalidBaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .push("groups")
            .push(group_id)
            .push("projects");
        url.query_pairs_mut()
            .append_pair("per_page", &PER_PAGE.to_string())
            .append_pair("page", &page.to_string());
        Ok(url)
    }
}

fn parse_base_url(value: &str) -> ClientResult<Url> {
    let value = value.trim();
    let value = if value.is_empty() { DEFAULT_BASE_URL } else { value };
    let url = Url::parse(value).map_err(|_| ClientError::InvalidBaseUrl(value.to_string()))?;
    match url.scheme() {
        "http" | "https" if url.has_host() => Ok(url),
        _ => Err(ClientError::InvalidBaseUrl(value.to_string())),
    }
}

/// Reads the page number from the `X-Next-Page` header which is
/// empty on the last page
fn next_page(headers: &HeaderMap) -> Option<u32> {
    headers
        .get("x-next-page")?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

#[cfg(test)]
mod test {
    use crate::gitlab::{next_page, ClientError, GitLabClient, Project};
    use reqwest::header::{HeaderMap, HeaderValue};

    #[test]
    fn rejects_invalid_base_url() {
        for value in ["not a url", "ftp://gitlab.local/api/v4", "mailto:git@push.org"] {
            let result = GitLabClient::new("token", value);
            assert!(
                matches!(result, Err(ClientError::InvalidBaseUrl(_))),
                "{value} should be rejected"
            );
        }
    }

    #[test]
    fn empty_base_url_uses_default() {
        let client = GitLabClient::new("", "").unwrap();
        assert_eq!(client.base_url.as_str(), "https://gitlab.com/api/v4");
    }

    #[test]
    fn projects_url() {
        let client = GitLabClient::new("token", "https://gitlab-ci.local/api/v4/").unwrap();
        let url = client.projects_url("238", 3).unwrap();
        assert_eq!(
            url.as_str(),
            "https://gitlab-ci.local/api/v4/groups/238/projects?per_page=100&page=3"
        );

        // Group paths are encoded into a single segment
        let url = client.projects_url("team/tools", 1).unwrap();
        assert_eq!(
            url.as_str(),
            "https://gitlab-ci.local/api/v4/groups/team%2Ftools/projects?per_page=100&page=1"
        );
    }

    #[test]
    fn parse_projects() {
        let body = r#"[
            {"id": 1, "name": "A", "ssh_url_to_repo": "git@gitlab.local:group/a.git", "http_url_to_repo": "https://gitlab.local/group/a.git"},
            {"id": 2, "name": "B", "ssh_url_to_repo": "git@gitlab.local:group/b.git"}
        ]"#;
        let projects: Vec<Project> = serde_json::from_str(body).unwrap();
        assert_eq!(
            projects,
            vec![
                Project {
                    name: "A".to_string(),
                    ssh_url_to_repo: "git@gitlab.local:group/a.git".to_string(),
                },
                Project {
                    name: "B".to_string(),
                    ssh_url_to_repo: "git@gitlab.local:group/b.git".to_string(),
                },
            ]
        );
    }

    #[test]
    fn pagination_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(next_page(&headers), None);

        headers.insert("x-next-page", HeaderValue::from_static(""));
        assert_eq!(next_page(&headers), None);

        headers.insert("x-next-page", HeaderValue::from_static("2"));
        assert_eq!(next_page(&headers), Some(2));
    }
}
