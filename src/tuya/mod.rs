pub mod client;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Device data points, keyed by their numeric id as a string ("1", "2", ...).
pub type PropertyMap = serde_json::Map<String, Value>;

/// The data point most devices use for their main switch.
pub const DEFAULT_DPS: &str = "1";

/// Everything needed to talk to one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub id: String,
    /// 16-character local key.
    pub key: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    "3.1".to_string()
}

impl DeviceIdentity {
    pub fn new(id: &str, key: &str, ip: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            key: key.to_string(),
            ip: ip.map(String::from),
            version: default_version(),
        }
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }
}

/// How a query result is shaped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Return the whole decoded response.
    pub schema: bool,
    /// Return a single data point.
    pub dps: Option<String>,
}

impl QueryOptions {
    pub fn schema() -> Self {
        Self {
            schema: true,
            dps: None,
        }
    }

    pub fn dps(index: impl Into<String>) -> Self {
        Self {
            schema: false,
            dps: Some(index.into()),
        }
    }
}

/// A state change to push to the device.
#[derive(Debug, Clone, PartialEq)]
pub enum SetRequest {
    SetByIndex { index: String, value: Value },
    /// Sets [`DEFAULT_DPS`].
    SetDefault { value: Value },
    SetMap(PropertyMap),
}

impl SetRequest {
    pub fn into_dps(self) -> PropertyMap {
        match self {
            SetRequest::SetByIndex { index, value } => {
                let mut dps = PropertyMap::new();
                dps.insert(index, value);
                dps
            }
            SetRequest::SetDefault { value } => {
                let mut dps = PropertyMap::new();
                dps.insert(DEFAULT_DPS.to_string(), value);
                dps
            }
            SetRequest::SetMap(dps) => dps,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct QueryPayload<'a> {
    pub gw_id: &'a str,
    pub dev_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ControlPayload<'a> {
    pub dev_id: &'a str,
    pub uid: &'a str,
    /// Unix seconds, as a string.
    pub t: String,
    pub dps: PropertyMap,
}
