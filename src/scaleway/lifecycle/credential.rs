//! Build key pairs: generated locally with `ssh-keygen`, registered with IAM
//! so the image installs them at first boot, and deleted on teardown.

use std::ffi::OsString;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{debug, info};

use crate::backend::{Credential, CredentialRequest};
use crate::scaleway::{AUTH_HEADER, ScalewayBackend, ScalewayBackendError};
use crate::ssh::CommandRunner;

use super::{Answer, HTTP_CLIENT, parse, send};

const KEY_FILE: &str = "id_ed25519";
const PUBLIC_KEY_FILE: &str = "id_ed25519.pub";

#[derive(Serialize)]
struct CreateKeyRequest<'a> {
    name: &'a str,
    public_key: &'a str,
    project_id: &'a str,
}

#[derive(Deserialize)]
struct KeyResponse {
    id: String,
}

/// Arguments producing an unencrypted ed25519 key at `key_file`.
pub(crate) fn keygen_args(name: &str, key_file: &Utf8Path) -> Vec<OsString> {
    ["-t", "ed25519", "-N", "", "-C", name, "-f", key_file.as_str(), "-q"]
        .into_iter()
        .map(OsString::from)
        .collect()
}

impl<R: CommandRunner> ScalewayBackend<R> {
    pub(in crate::scaleway) async fn register_key(
        &self,
        request: &CredentialRequest,
    ) -> Result<Credential, ScalewayBackendError> {
        let (dir, key_file, public_key) = self.generate_keypair(&request.name)?;
        let url = format!("{}/iam/v1alpha1/ssh-keys", self.api_base());
        let payload = CreateKeyRequest {
            name: &request.name,
            public_key: public_key.trim(),
            project_id: &request.scope,
        };
        let operation = "register ssh key";
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
        let created: KeyResponse = parse(&body)?;
        info!(key_id = %created.id, name = %request.name, "registered build key");
        Ok(Credential::new(created.id, request.name.clone(), key_file).with_key_dir(dir))
    }

    pub(in crate::scaleway) async fn delete_key(
        &self,
        credential: &Credential,
    ) -> Result<(), ScalewayBackendError> {
        let url = format!(
            "{}/iam/v1alpha1/ssh-keys/{}",
            self.api_base(),
            credential.id
        );
        let answer = send(
            HTTP_CLIENT
                .delete(&url)
                .header(AUTH_HEADER, &self.config.secret_key),
            "delete ssh key",
        )
        .await?;
        if matches!(answer, Answer::Missing) {
            debug!(key_id = %credential.id, "build key already gone");
        }
        Ok(())
    }

    /// Generates a key pair in a fresh private directory.
    ///
    /// The directory travels with the returned credential so the private key
    /// disappears with it.
    pub(in crate::scaleway) fn generate_keypair(
        &self,
        name: &str,
    ) -> Result<(TempDir, Utf8PathBuf, String), ScalewayBackendError> {
        let failure = |message: String| ScalewayBackendError::KeyGeneration {
            name: name.to_owned(),
            message,
        };
        let dir = TempDir::new().map_err(|err| failure(err.to_string()))?;
        let dir_path = Utf8Path::from_path(dir.path())
            .ok_or_else(|| failure(String::from("temporary directory is not UTF-8")))?
            .to_path_buf();
        let key_file = dir_path.join(KEY_FILE);

        let output = self
            .runner
            .run(&self.config.ssh_keygen_bin, &keygen_args(name, &key_file))
            .map_err(|err| failure(err.to_string()))?;
        if !output.is_success() {
            return Err(failure(output.stderr.trim().to_owned()));
        }

        let public_key = Dir::open_ambient_dir(&dir_path, ambient_authority())
            .and_then(|keys| keys.read_to_string(PUBLIC_KEY_FILE))
            .map_err(|err| failure(err.to_string()))?;
        debug!(name, "generated build key pair");
        Ok((dir, key_file, public_key))
    }
}
