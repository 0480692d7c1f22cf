use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::error::{Result, TuyaError};
use crate::protocol::frame::{self, CommandType, Message, Payload};
use crate::protocol::CipherSuite;
use crate::transport::RetryingTransport;

use super::{
    ControlPayload, DEFAULT_DPS, DeviceIdentity, PropertyMap, QueryOptions, QueryPayload,
    SetRequest,
};

/// Client for a single device. Each call opens its own connection, so
/// clients for different devices share nothing and can run concurrently.
#[derive(Debug, Clone)]
pub struct DeviceClient {
    identity: DeviceIdentity,
    cipher: CipherSuite,
    transport: RetryingTransport,
    config: ClientConfig,
    cancel: CancellationToken,
}

impl DeviceClient {
    pub fn new(identity: DeviceIdentity, config: ClientConfig) -> Result<Self> {
        if identity.id.is_empty() {
            return Err(TuyaError::InvalidIdentity("device id is empty".into()));
        }
        if identity.key.is_empty() {
            return Err(TuyaError::InvalidIdentity("device key is empty".into()));
        }
        let cipher = CipherSuite::new(&identity.key, &identity.version)?;
        let transport = RetryingTransport::new(&config);

        Ok(Self {
            identity,
            cipher,
            transport,
            config,
            cancel: CancellationToken::new(),
        })
    }

    /// Abort in-flight and future requests when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Read device state, shaped per `options`.
    pub async fn query(&self, options: &QueryOptions) -> Result<Value> {
        let body = serde_json::to_vec(&QueryPayload {
            gw_id: &self.identity.id,
            dev_id: &self.identity.id,
        })?;

        let message = self.exchange(CommandType::Query, &body).await?;
        let response = self.resolve_payload(message.payload)?;
        debug!("Query response from {}: {}", self.identity.id, response);
        shape_query(response, options)
    }

    /// Push a state change. The device acknowledges without echoing state.
    pub async fn update(&self, request: SetRequest) -> Result<()> {
        let payload = ControlPayload {
            dev_id: &self.identity.id,
            uid: "",
            t: unix_timestamp().to_string(),
            dps: request.into_dps(),
        };
        let plaintext = serde_json::to_vec(&payload)?;
        debug!(
            "Control payload for {}: {}",
            self.identity.id,
            String::from_utf8_lossy(&plaintext)
        );

        let envelope = self.cipher.envelope(&plaintext);
        let ack = self.exchange(CommandType::Control, &envelope).await?;
        debug!(
            "Control ack from {}: command=0x{:02x} return_code={:?}",
            self.identity.id, ack.command, ack.return_code
        );
        Ok(())
    }

    /// The default data point, or the whole map for multi-point devices.
    pub async fn status(&self) -> Result<Value> {
        self.query(&QueryOptions::default()).await
    }

    pub async fn on(&self) -> Result<Value> {
        self.set_status(Value::Bool(true)).await
    }

    pub async fn off(&self) -> Result<Value> {
        self.set_status(Value::Bool(false)).await
    }

    /// Flip the default data point and return the new state.
    pub async fn toggle(&self) -> Result<Value> {
        let current = self.query(&QueryOptions::dps(DEFAULT_DPS)).await?;
        let Some(current) = current.as_bool() else {
            return Err(TuyaError::UnexpectedResponse(format!(
                "data point {DEFAULT_DPS} is not a boolean: {current}"
            )));
        };
        self.set_status(Value::Bool(!current)).await
    }

    /// Write the default data point and return the new state.
    pub async fn set_status(&self, value: Value) -> Result<Value> {
        info!("Setting {} dp {} to {}", self.identity.id, DEFAULT_DPS, value);
        self.update(SetRequest::SetDefault { value }).await?;
        self.status().await
    }

    /// Apply a color through `convert`, which maps a color string to the
    /// data points that express it on this device.
    pub async fn set_color<F>(&self, color: &str, convert: F) -> Result<Value>
    where
        F: FnOnce(&str) -> PropertyMap,
    {
        let dps = convert(color);
        info!("Setting {} color to {} ({} dps)", self.identity.id, color, dps.len());
        self.update(SetRequest::SetMap(dps)).await?;
        self.status().await
    }

    async fn exchange(&self, command: CommandType, body: &[u8]) -> Result<Message> {
        let request = frame::encode(body, command);
        self.transport
            .send(
                self.identity.ip.as_deref(),
                &request,
                self.config.response_timeout,
                &self.cancel,
            )
            .await
    }

    /// Turn a reply payload into JSON, decrypting it when it is not plaintext.
    fn resolve_payload(&self, payload: Payload) -> Result<Value> {
        match payload {
            Payload::Json(map) => Ok(Value::Object(map)),
            Payload::Raw(bytes) => {
                let plaintext = self.cipher.decrypt(&bytes)?;
                match serde_json::from_slice(&plaintext) {
                    Ok(value) => Ok(value),
                    Err(_) => Ok(Value::String(
                        String::from_utf8_lossy(&plaintext).into_owned(),
                    )),
                }
            }
            Payload::Empty => Err(TuyaError::UnexpectedResponse(
                "device sent an empty reply".into(),
            )),
        }
    }
}

/// Shape a decoded query response.
///
/// `schema` returns it whole; a requested data point returns that value
/// (null when absent); otherwise a lone default data point is unwrapped and
/// anything else returns the whole `dps` map.
pub fn shape_query(response: Value, options: &QueryOptions) -> Result<Value> {
    if options.schema {
        return Ok(response);
    }

    let mut root = match response {
        Value::Object(root) => root,
        other => {
            return Err(TuyaError::UnexpectedResponse(format!(
                "expected a JSON object, got {other}"
            )));
        }
    };
    let Some(Value::Object(mut dps)) = root.remove("dps") else {
        return Err(TuyaError::UnexpectedResponse(
            "response has no dps map".into(),
        ));
    };

    if let Some(index) = &options.dps {
        return Ok(dps.remove(index).unwrap_or(Value::Null));
    }

    if dps.len() == 1 {
        if let Some(value) = dps.remove(DEFAULT_DPS) {
            return Ok(value);
        }
    }
    Ok(Value::Object(dps))
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
