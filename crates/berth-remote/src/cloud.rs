//! Cloud instance API
//!
//! The resolver only needs four operations: find by tag, create, get, delete.
//! [`DigitalOceanApi`] implements them over the v2 REST API.

use crate::error::RemoteError;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Default API endpoint
pub const DIGITALOCEAN_API_URL: &str = "https://api.digitalocean.com";

/// Lifecycle status reported by the cloud provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    New,
    Active,
    Off,
    Archive,
    Unknown,
}

impl InstanceStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "new" => InstanceStatus::New,
            "active" => InstanceStatus::Active,
            "off" => InstanceStatus::Off,
            "archive" => InstanceStatus::Archive,
            _ => InstanceStatus::Unknown,
        }
    }
}

/// A compute instance as seen through the cloud API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub status: InstanceStatus,
    pub public_ipv4: Option<String>,
    pub region: String,
    pub size: String,
    pub image: String,
    pub tags: Vec<String>,
}

impl Instance {
    /// Running and addressable.
    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Active && self.public_ipv4.is_some()
    }
}

/// Shape of an instance to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub name: String,
    pub region: String,
    pub size: String,
    pub image: String,
    /// SSH key fingerprints (or ids) installed for the initial login.
    pub ssh_keys: Vec<String>,
    pub tags: Vec<String>,
}

/// Cloud instance operations consumed by the resolver and teardown.
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// First instance carrying `tag`, if any.
    async fn find_by_tag(&self, tag: &str) -> Result<Option<Instance>>;

    /// Request a new instance. It is usually not running yet.
    async fn create(&self, spec: &InstanceSpec) -> Result<Instance>;

    /// Current view of an instance.
    async fn get(&self, id: &str) -> Result<Instance>;

    /// Destroy an instance.
    async fn delete(&self, id: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// DigitalOcean wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DropletList {
    droplets: Vec<Droplet>,
}

#[derive(Debug, Deserialize)]
struct DropletEnvelope {
    droplet: Droplet,
}

#[derive(Debug, Deserialize)]
struct Droplet {
    id: u64,
    name: String,
    status: String,
    #[serde(default)]
    networks: Networks,
    #[serde(default)]
    region: Option<Slug>,
    #[serde(default)]
    size_slug: Option<String>,
    #[serde(default)]
    image: Option<Slug>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Networks {
    #[serde(default)]
    v4: Vec<NetworkV4>,
}

#[derive(Debug, Deserialize)]
struct NetworkV4 {
    ip_address: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct Slug {
    #[serde(default)]
    slug: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateDroplet<'a> {
    name: &'a str,
    region: &'a str,
    size: &'a str,
    image: &'a str,
    ssh_keys: &'a [String],
    tags: &'a [String],
}

impl From<Droplet> for Instance {
    fn from(d: Droplet) -> Self {
        let public_ipv4 = d
            .networks
            .v4
            .into_iter()
            .find(|n| n.kind == "public")
            .map(|n| n.ip_address);
        Instance {
            id: d.id.to_string(),
            name: d.name,
            status: InstanceStatus::parse(&d.status),
            public_ipv4,
            region: d.region.and_then(|r| r.slug).unwrap_or_default(),
            size: d.size_slug.unwrap_or_default(),
            image: d.image.and_then(|i| i.slug).unwrap_or_default(),
            tags: d.tags,
        }
    }
}

/// DigitalOcean droplet client
pub struct DigitalOceanApi {
    base_url: String,
    token: String,
    http_client: reqwest::Client,
}

impl DigitalOceanApi {
    /// Create a client. A missing or blank token is a prerequisite failure.
    pub fn new(base_url: &str, token: Option<&str>) -> Result<Self> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(RemoteError::CloudTokenMissing)?
            .to_string();
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("berth/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(DigitalOceanApi {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            http_client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(RemoteError::CloudApi {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl CloudApi for DigitalOceanApi {
    async fn find_by_tag(&self, tag: &str) -> Result<Option<Instance>> {
        debug!(tag = %tag, "looking up droplets by tag");
        let response = self
            .http_client
            .get(self.url("/v2/droplets"))
            .query(&[("tag_name", tag)])
            .bearer_auth(&self.token)
            .send()
            .await?;
        let list: DropletList = Self::check(response).await?.json().await?;
        Ok(list.droplets.into_iter().next().map(Instance::from))
    }

    async fn create(&self, spec: &InstanceSpec) -> Result<Instance> {
        info!(name = %spec.name, region = %spec.region, size = %spec.size, "creating droplet");
        let body = CreateDroplet {
            name: &spec.name,
            region: &spec.region,
            size: &spec.size,
            image: &spec.image,
            ssh_keys: &spec.ssh_keys,
            tags: &spec.tags,
        };
        let response = self
            .http_client
            .post(self.url("/v2/droplets"))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        let envelope: DropletEnvelope = Self::check(response).await?.json().await?;
        Ok(envelope.droplet.into())
    }

    async fn get(&self, id: &str) -> Result<Instance> {
        let response = self
            .http_client
            .get(self.url(&format!("/v2/droplets/{id}")))
            .bearer_auth(&self.token)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(RemoteError::InstanceNotFound(id.to_string()));
        }
        let envelope: DropletEnvelope = Self::check(response).await?.json().await?;
        Ok(envelope.droplet.into())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        info!(id = %id, "deleting droplet");
        let response = self
            .http_client
            .delete(self.url(&format!("/v2/droplets/{id}")))
            .bearer_auth(&self.token)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(RemoteError::InstanceNotFound(id.to_string()));
        }
        Self::check(response).await?;
        Ok(())
    }
}
