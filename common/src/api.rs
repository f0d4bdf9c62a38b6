//! Request and response shapes shared by the HTTP adapters.
//!
//! Adapters decode a body into one of the `*Body` types, wrap it in a [`Request`], hand it to
//! the panel loop and turn the [`Response`] back into a status code plus JSON document.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    config::DeviceConfig,
    error::PanelError,
    events::ManualAppointment,
    ota::{UpdateReport, UpdateRequest, UpdateTarget},
    types::PanelStatus,
};

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppointmentBody {
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub color: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteAppointmentBody {
    pub index: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateBody {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleBody {
    #[serde(default)]
    pub fw_url: String,
    #[serde(default)]
    pub fw_sha256: Option<String>,
    #[serde(default)]
    pub fs_url: Option<String>,
    #[serde(default)]
    pub fs_sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateJob {
    Firmware(UpdateRequest),
    Filesystem(UpdateRequest),
    Bundle {
        firmware: UpdateRequest,
        filesystem: Option<UpdateRequest>,
    },
}

impl UpdateJob {
    pub fn firmware(body: UpdateBody) -> Self {
        Self::Firmware(
            UpdateRequest::new(UpdateTarget::Firmware, body.url).with_sha256(body.sha256),
        )
    }

    pub fn filesystem(body: UpdateBody) -> Self {
        Self::Filesystem(
            UpdateRequest::new(UpdateTarget::Filesystem, body.url).with_sha256(body.sha256),
        )
    }

    pub fn bundle(body: BundleBody) -> Self {
        let fs_sha256 = body.fs_sha256;
        let filesystem = body
            .fs_url
            .filter(|url| !url.trim().is_empty())
            .map(|url| UpdateRequest::new(UpdateTarget::Filesystem, url).with_sha256(fs_sha256));
        Self::Bundle {
            firmware: UpdateRequest::new(UpdateTarget::Firmware, body.fw_url)
                .with_sha256(body.fw_sha256),
            filesystem,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Request {
    GetConfig,
    PatchConfig(Value),
    Status,
    ListAppointments,
    AddAppointment(AppointmentBody),
    DeleteAppointment(DeleteAppointmentBody),
    Update(UpdateJob),
}

#[derive(Debug, Clone)]
pub enum Response {
    Config(Box<DeviceConfig>),
    Status(Box<PanelStatus>),
    Appointments(Vec<ManualAppointment>),
    Ok,
    /// The update finalized; the adapter acknowledges and then restarts the device.
    Rebooting(Vec<UpdateReport>),
    Error(PanelError),
}

impl Response {
    pub fn is_reboot(&self) -> bool {
        matches!(self, Self::Rebooting(_))
    }

    /// HTTP status code and JSON document for this response.
    pub fn to_json(&self) -> (u16, Value) {
        let body = match self {
            Self::Config(config) => serde_json::to_value(config.as_ref()),
            Self::Status(status) => serde_json::to_value(status.as_ref()),
            Self::Appointments(list) => serde_json::to_value(list),
            Self::Ok => Ok(json!({ "status": "ok" })),
            Self::Rebooting(_) => Ok(json!({ "status": "rebooting" })),
            Self::Error(err) => return (400, error_json(&err.to_string())),
        };

        match body {
            Ok(value) => (200, value),
            Err(err) => (500, error_json(&err.to_string())),
        }
    }
}

impl From<PanelError> for Response {
    fn from(err: PanelError) -> Self {
        Self::Error(err)
    }
}

pub fn error_json(message: &str) -> Value {
    json!(ErrorBody {
        error: message.to_string(),
    })
}
