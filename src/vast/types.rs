//! Wire shapes of the Vast.ai REST API and their mapping onto the
//! marketplace model.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::backend::{InstanceSnapshot, LaunchRequest, Offer, OfferQuery, PortBinding};

const RUNTYPE_DIRECT: &str = "ssh_direc ssh_proxy";
const RUNTYPE_PROXY: &str = "ssh_proxy";

#[derive(Debug, Deserialize)]
pub(crate) struct OffersResponse {
    #[serde(default)]
    pub(crate) offers: Vec<WireOffer>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireOffer {
    id: u64,
    #[serde(default)]
    dph_total: f64,
    #[serde(default)]
    gpu_name: String,
    #[serde(default)]
    num_gpus: u32,
    #[serde(default)]
    score: f64,
}

impl From<WireOffer> for Offer {
    fn from(value: WireOffer) -> Self {
        Self {
            id: value.id,
            dph_total: value.dph_total,
            gpu_name: value.gpu_name,
            num_gpus: value.num_gpus,
            score: value.score,
        }
    }
}

/// Builds the `/bundles/` search body: exact GPU match, unrented, verified,
/// under the price ceiling, best score first.
pub(crate) fn search_body(query: &OfferQuery) -> Value {
    json!({
        "num_gpus": { "eq": query.gpu_count },
        "gpu_name": { "eq": query.gpu_name },
        "rented": { "eq": false },
        "verified": { "eq": true },
        "rentable": { "eq": true },
        "dph_total": { "lte": query.max_price },
        "order": [["score", "desc"]],
        "type": "on-demand",
    })
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateInstancePayload<'a> {
    client_id: &'static str,
    image: &'a str,
    disk: u32,
    env: BTreeMap<String, String>,
    onstart: &'a str,
    runtype: &'static str,
    label: &'a str,
}

impl<'a> CreateInstancePayload<'a> {
    /// Port publications travel inside the env map as `-p <port>:<port>`
    /// keys, which is how the API receives docker-style options.
    pub(crate) fn from_request(request: &'a LaunchRequest) -> Self {
        let mut env = request.env.clone();
        for port in &request.exposed_ports {
            env.insert(format!("-p {port}:{port}"), String::from("1"));
        }
        Self {
            client_id: "me",
            image: &request.image,
            disk: request.disk_gb,
            env,
            onstart: &request.onstart,
            runtype: if request.direct {
                RUNTYPE_DIRECT
            } else {
                RUNTYPE_PROXY
            },
            label: &request.label,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreateInstanceResponse {
    #[serde(default)]
    pub(crate) success: bool,
    pub(crate) new_contract: Option<u64>,
    pub(crate) msg: Option<String>,
    pub(crate) error: Option<String>,
}

impl CreateInstanceResponse {
    pub(crate) fn failure_message(&self) -> String {
        self.msg
            .clone()
            .or_else(|| self.error.clone())
            .unwrap_or_else(|| String::from("Unknown error"))
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct InstanceResponse {
    #[serde(default)]
    instances: Value,
}

#[derive(Debug, Deserialize)]
struct WireInstance {
    id: u64,
    actual_status: Option<String>,
    status_msg: Option<String>,
    public_ipaddr: Option<String>,
    #[serde(default)]
    ports: Option<BTreeMap<String, Option<Vec<WirePortBinding>>>>,
    ssh_host: Option<String>,
    ssh_port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct WirePortBinding {
    #[serde(rename = "HostIp", default)]
    host_ip: String,
    #[serde(rename = "HostPort")]
    host_port: Value,
}

impl WirePortBinding {
    fn into_binding(self) -> Option<PortBinding> {
        let host_port = match self.host_port {
            Value::String(text) => text.trim().parse().ok()?,
            Value::Number(number) => u16::try_from(number.as_u64()?).ok()?,
            _ => return None,
        };
        Some(PortBinding {
            host_ip: self.host_ip,
            host_port,
        })
    }
}

impl From<WireInstance> for InstanceSnapshot {
    fn from(value: WireInstance) -> Self {
        let ports = value
            .ports
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(key, bindings)| {
                let parsed: Vec<PortBinding> = bindings
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(WirePortBinding::into_binding)
                    .collect();
                (!parsed.is_empty()).then_some((key, parsed))
            })
            .collect();
        Self {
            id: value.id,
            actual_status: value.actual_status,
            status_msg: value.status_msg,
            public_ipaddr: value.public_ipaddr,
            ports,
            ssh_host: value.ssh_host,
            ssh_port: value.ssh_port,
        }
    }
}

impl InstanceResponse {
    /// The API returns `{"instances": {...}}` for a known instance and a
    /// null or empty value while the record is not yet visible.
    pub(crate) fn into_snapshot(self) -> Result<Option<InstanceSnapshot>, serde_json::Error> {
        let record = match self.instances {
            Value::Null => return Ok(None),
            Value::Array(items) => {
                let Some(first) = items.into_iter().next() else {
                    return Ok(None);
                };
                first
            }
            Value::Object(map) if map.is_empty() => return Ok(None),
            other => other,
        };
        let wire: WireInstance = serde_json::from_value(record)?;
        Ok(Some(wire.into()))
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct LogRequestResponse {
    pub(crate) result_url: Option<String>,
    pub(crate) msg: Option<String>,
}
