//! Boots a Compute Engine instance with the script as startup metadata.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value as Json, json};
use tracing::{debug, info};
use uuid::Uuid;

use super::{Backend, BackendContext, BackendError, BackendFuture, LaunchHandle, LaunchRequest, options};
use crate::exec::{os_args, run_checked};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const COMPUTE_API_BASE: &str = "https://compute.googleapis.com/compute/v1";
const TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";
const SCOPES: [&str; 3] = [
    "https://www.googleapis.com/auth/devstorage.read_write",
    "https://www.googleapis.com/auth/logging.write",
    "https://www.googleapis.com/auth/compute",
];

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

fn default_image_project() -> String {
    String::from("deeplearning-platform-release")
}

fn default_image_family() -> String {
    String::from("pytorch-latest-gpu")
}

#[derive(Debug, Deserialize)]
struct GceOptions {
    project_id: String,
    zone: String,
    instance_type: String,
    #[serde(default)]
    image_id: Option<String>,
    #[serde(default = "default_image_project")]
    image_project: String,
    #[serde(default = "default_image_family")]
    image_family: String,
    #[serde(default)]
    accelerator_type: Option<String>,
    #[serde(default)]
    accelerator_count: Option<u32>,
    #[serde(default)]
    preemptible: bool,
    #[serde(default)]
    dry: bool,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    api_base: Option<String>,
}

impl GceOptions {
    fn source_image(&self) -> String {
        self.image_id.clone().unwrap_or_else(|| {
            format!(
                "projects/{}/global/images/family/{}",
                self.image_project, self.image_family
            )
        })
    }

    fn instance_name(&self, run_id: Uuid) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("sortie-{run_id}"))
    }
}

/// Builds the `instances.insert` body.
fn insert_body(opts: &GceOptions, script: &str, run_id: Uuid) -> Json {
    let mut items = vec![json!({ "key": "startup-script", "value": script })];
    items.extend(
        opts.tags
            .iter()
            .map(|(key, value)| json!({ "key": key, "value": value })),
    );

    let mut body = json!({
        "name": opts.instance_name(run_id),
        "machineType": format!("zones/{}/machineTypes/{}", opts.zone, opts.instance_type),
        "scheduling": {
            "preemptible": opts.preemptible,
            "onHostMaintenance": "TERMINATE",
            "automaticRestart": false,
        },
        "disks": [{
            "boot": true,
            "autoDelete": true,
            "initializeParams": { "sourceImage": opts.source_image() },
        }],
        "networkInterfaces": [{
            "network": "global/networks/default",
            "accessConfigs": [{ "type": "ONE_TO_ONE_NAT", "name": "External NAT" }],
        }],
        "serviceAccounts": [{ "email": "default", "scopes": SCOPES }],
        "metadata": { "items": items },
    });

    if let Some(ref accelerator) = opts.accelerator_type
        && let Some(map) = body.as_object_mut()
    {
        map.insert(
            String::from("guestAccelerators"),
            json!([{
                "acceleratorType": format!("zones/{}/acceleratorTypes/{accelerator}", opts.zone),
                "acceleratorCount": opts.accelerator_count.unwrap_or(1),
            }]),
        );
    }
    body
}

/// Posts instance insert requests to the Compute REST API.
pub struct GceBackend<'a> {
    ctx: BackendContext<'a>,
}

impl<'a> GceBackend<'a> {
    /// Creates the adapter.
    #[must_use]
    pub const fn new(ctx: BackendContext<'a>) -> Self {
        Self { ctx }
    }

    fn access_token(&self, opts: &GceOptions) -> Result<String, BackendError> {
        if let Some(ref token) = opts.token {
            return Ok(token.clone());
        }
        if let Ok(token) = std::env::var(TOKEN_ENV)
            && !token.trim().is_empty()
        {
            return Ok(token.trim().to_owned());
        }
        let output = run_checked(
            self.ctx.runner,
            &self.ctx.settings.gcloud_bin,
            &os_args(["auth", "print-access-token"]),
        )?;
        Ok(output.stdout.trim().to_owned())
    }

    async fn insert(&self, opts: &GceOptions, body: &Json) -> Result<Json, BackendError> {
        let token = self.access_token(opts)?;
        let base = opts.api_base.as_deref().unwrap_or(COMPUTE_API_BASE);
        let url = format!(
            "{base}/projects/{}/zones/{}/instances",
            opts.project_id, opts.zone
        );
        debug!(url = %url, "inserting instance");

        let response = HTTP_CLIENT
            .post(&url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|err| BackendError::Http {
                message: err.to_string(),
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|err| BackendError::Http {
            message: err.to_string(),
        })?;
        if !status.is_success() {
            return Err(BackendError::Provider {
                program: url,
                status: status.to_string(),
                stderr: text,
            });
        }
        serde_json::from_str(&text).map_err(|err| BackendError::Encode {
            message: err.to_string(),
        })
    }
}

impl Backend for GceBackend<'_> {
    fn launch<'a>(&'a self, request: &'a LaunchRequest) -> BackendFuture<'a, LaunchHandle> {
        Box::pin(async move {
            let opts: GceOptions = options(&request.config)?;
            let body = insert_body(&opts, &request.script, request.run_id);
            if opts.dry {
                info!("dry run: returning the instance insert request");
                return Ok(LaunchHandle::Request(body));
            }

            let operation = self.insert(&opts, &body).await?;
            let name = opts.instance_name(request.run_id);
            info!(instance = %name, operation = ?operation.get("name"), "instance insert accepted");
            Ok(LaunchHandle::Instance(name))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn opts() -> GceOptions {
        serde_yaml::from_str(
            "project_id: lab\nzone: us-west1-b\ninstance_type: n1-standard-4\ntags:\n  owner: sam\n",
        )
        .expect("options parse")
    }

    #[rstest]
    fn body_carries_script_and_tags_as_metadata(opts: GceOptions) {
        let body = insert_body(&opts, "echo hi", Uuid::nil());

        assert_eq!(
            body["metadata"]["items"],
            json!([
                { "key": "startup-script", "value": "echo hi" },
                { "key": "owner", "value": "sam" },
            ])
        );
        assert_eq!(body["machineType"], json!("zones/us-west1-b/machineTypes/n1-standard-4"));
        assert_eq!(body["scheduling"]["automaticRestart"], json!(false));
    }

    #[rstest]
    fn default_image_family_is_used(opts: GceOptions) {
        let body = insert_body(&opts, "", Uuid::nil());

        assert_eq!(
            body["disks"][0]["initializeParams"]["sourceImage"],
            json!("projects/deeplearning-platform-release/global/images/family/pytorch-latest-gpu")
        );
        assert_eq!(
            body["name"],
            json!("sortie-00000000-0000-0000-0000-000000000000")
        );
        assert!(body.get("guestAccelerators").is_none());
    }

    #[rstest]
    fn accelerators_are_attached(mut opts: GceOptions) {
        opts.accelerator_type = Some(String::from("nvidia-tesla-t4"));
        opts.accelerator_count = Some(2);
        opts.preemptible = true;

        let body = insert_body(&opts, "", Uuid::nil());

        assert_eq!(
            body["guestAccelerators"],
            json!([{
                "acceleratorType": "zones/us-west1-b/acceleratorTypes/nvidia-tesla-t4",
                "acceleratorCount": 2,
            }])
        );
        assert_eq!(body["scheduling"]["preemptible"], json!(true));
    }
}
