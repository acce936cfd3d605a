//! Status polling and termination for the Scaleway backend.

use std::net::IpAddr;
use std::str::FromStr;

use scaleway_rs::ScalewayError;
use serde::Deserialize;
use tracing::debug;

use crate::backend::{InstanceState, InstanceStatus};
use crate::scaleway::types::ServerState;
use crate::scaleway::{AUTH_HEADER, ScalewayBackend, ScalewayBackendError};
use crate::ssh::CommandRunner;

use super::{Answer, HTTP_CLIENT, parse, send};

#[derive(Debug, Deserialize)]
struct DescribeResponse {
    server: ServerPayload,
}

/// Fields of a server description the backend reads.
#[derive(Debug, Deserialize)]
pub(crate) struct ServerPayload {
    state: String,
    #[serde(default)]
    private_ip: Option<String>,
    #[serde(default)]
    private_nics: Vec<NicPayload>,
}

#[derive(Debug, Deserialize)]
struct NicPayload {
    #[serde(default)]
    private_ips: Vec<NicAddress>,
}

#[derive(Debug, Deserialize)]
struct NicAddress {
    address: String,
}

/// Converts a server description into the backend-neutral state.
///
/// The legacy `private_ip` field wins; otherwise the first address of the
/// first private network card is used. Addresses may carry a prefix length.
pub(crate) fn state_from_payload(server: &ServerPayload) -> InstanceState {
    let nic_addresses = server
        .private_nics
        .iter()
        .flat_map(|nic| nic.private_ips.iter().map(|ip| ip.address.as_str()));
    let private_address = server
        .private_ip
        .as_deref()
        .into_iter()
        .chain(nic_addresses)
        .find_map(parse_address);
    InstanceState {
        status: ServerState::from(server.state.as_str()).status(),
        private_address,
    }
}

fn parse_address(raw: &str) -> Option<IpAddr> {
    let host = raw.split_once('/').map_or(raw, |(address, _)| address);
    IpAddr::from_str(host).ok()
}

impl<R: CommandRunner> ScalewayBackend<R> {
    pub(in crate::scaleway) async fn fetch_state(
        &self,
        instance_id: &str,
    ) -> Result<InstanceState, ScalewayBackendError> {
        let url = format!(
            "{}/zones/{}/servers/{instance_id}",
            self.instance_base(),
            self.zone()
        );
        let answer = send(
            HTTP_CLIENT
                .get(&url)
                .header(AUTH_HEADER, &self.config.secret_key),
            "describe server",
        )
        .await?;
        match answer {
            Answer::Missing => Ok(InstanceState::gone()),
            Answer::Found(body) => {
                let described: DescribeResponse = parse(&body)?;
                Ok(state_from_payload(&described.server))
            }
        }
    }

    pub(in crate::scaleway) async fn terminate(
        &self,
        instance_id: &str,
    ) -> Result<InstanceStatus, ScalewayBackendError> {
        let zone = self.zone();
        match self
            .api
            .perform_instance_action_async(zone.as_str(), instance_id, "terminate")
            .await
        {
            Ok(_) => {}
            Err(ScalewayError::Api(api_err)) if api_err.etype == "not_found" => {
                debug!(instance_id, "server already gone");
                return Ok(InstanceStatus::NonExistent);
            }
            Err(other) => return Err(other.into()),
        }
        Ok(self.fetch_state(instance_id).await?.status)
    }
}
