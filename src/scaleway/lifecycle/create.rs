//! Instance creation for the Scaleway backend.
//!
//! The server is created stopped so the private network card can be attached
//! before first boot, then powered on. A server that fails to start is
//! deleted again before the error is returned, since the caller only
//! registers teardown for launches that succeed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::{InstanceStatus, LaunchRequest, LaunchedInstance};
use crate::scaleway::types::Zone;
use crate::scaleway::{AUTH_HEADER, ScalewayBackend, ScalewayBackendError};
use crate::ssh::CommandRunner;

use super::{Answer, HTTP_CLIENT, parse, send};

const BYTES_PER_GB: u64 = 1_000_000_000;
const ROOT_VOLUME_TYPE: &str = "sbs_volume";

#[derive(Debug, Serialize)]
pub(crate) struct CreateServerRequest {
    name: String,
    commercial_type: String,
    image: String,
    project: String,
    security_group: String,
    tags: Vec<String>,
    volumes: BTreeMap<String, VolumeTemplate>,
    dynamic_ip_required: bool,
    stopped: bool,
}

#[derive(Debug, Serialize)]
struct VolumeTemplate {
    size: u64,
    volume_type: &'static str,
}

#[derive(Serialize)]
struct PrivateNicRequest<'a> {
    private_network_id: &'a str,
}

#[derive(Deserialize)]
struct CreateServerResponse {
    server: CreatedServer,
}

#[derive(Deserialize)]
struct CreatedServer {
    id: String,
}

impl CreateServerRequest {
    /// Payload for a stopped server without a public address.
    pub(crate) fn from_launch(request: &LaunchRequest) -> Self {
        let root = VolumeTemplate {
            size: u64::from(request.volume.size_gb) * BYTES_PER_GB,
            volume_type: ROOT_VOLUME_TYPE,
        };
        Self {
            name: format!("kiln-build-{}", Uuid::new_v4().simple()),
            commercial_type: request.instance_type.clone(),
            image: request.image_id.clone(),
            project: request.instance_profile.clone(),
            security_group: request.security_group_id.clone(),
            tags: request.tags.iter().map(ToString::to_string).collect(),
            volumes: BTreeMap::from([(String::from("0"), root)]),
            dynamic_ip_required: false,
            stopped: true,
        }
    }
}

impl<R: CommandRunner> ScalewayBackend<R> {
    pub(in crate::scaleway) async fn create_and_start(
        &self,
        request: &LaunchRequest,
    ) -> Result<LaunchedInstance, ScalewayBackendError> {
        request.validate()?;
        let zone = self.zone();
        let id = self.create_server(&zone, request).await?;
        info!(instance_id = %id, zone = %zone, "created build server");

        if let Err(err) = self.start_server(&zone, &id, &request.subnet_id).await {
            warn!(instance_id = %id, error = %err, "start failed; deleting server");
            if let Err(cleanup) = self.api.delete_instance_async(zone.as_str(), &id).await {
                warn!(instance_id = %id, error = %cleanup, "could not delete unstarted server");
            }
            return Err(ScalewayBackendError::StartFailed {
                instance_id: id,
                message: err.to_string(),
            });
        }

        Ok(LaunchedInstance {
            id,
            private_address: None,
            status: InstanceStatus::Pending,
        })
    }

    async fn create_server(
        &self,
        zone: &Zone,
        request: &LaunchRequest,
    ) -> Result<String, ScalewayBackendError> {
        let url = format!("{}/zones/{zone}/servers", self.instance_base());
        let payload = CreateServerRequest::from_launch(request);
        let operation = "create server";
        let answer = send(
            HTTP_CLIENT
                .post(&url)
                .header(AUTH_HEADER, &self.config.secret_key)
                .json(&payload),
            operation,
        )
        .await?;
        let Answer::Found(body) = answer else {
            return Err(ScalewayBackendError::Api {
                operation,
                status: 404,
                message: url,
            });
        };
        let created: CreateServerResponse = parse(&body)?;
        Ok(created.server.id)
    }

    async fn start_server(
        &self,
        zone: &Zone,
        id: &str,
        private_network_id: &str,
    ) -> Result<(), ScalewayBackendError> {
        let url = format!("{}/zones/{zone}/servers/{id}/private_nics", self.instance_base());
        let operation = "attach private network";
        let answer = send(
            HTTP_CLIENT
                .post(&url)
                .header(AUTH_HEADER, &self.config.secret_key)
                .json(&PrivateNicRequest { private_network_id }),
            operation,
        )
        .await?;
        if matches!(answer, Answer::Missing) {
            return Err(ScalewayBackendError::Api {
                operation,
                status: 404,
                message: url,
            });
        }
        self.api
            .perform_instance_action_async(zone.as_str(), id, "poweron")
            .await?;
        Ok(())
    }
}
