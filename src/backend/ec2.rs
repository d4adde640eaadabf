//! Boots an EC2 instance (spot or on-demand) with the script as user data.
//!
//! Requests are sent through the `aws` CLI with `--cli-input-json`, so the
//! ambient AWS profile and region apply exactly as they do for mounts.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde_json::{Value as Json, json};
use tracing::info;

use super::{Backend, BackendContext, BackendError, BackendFuture, LaunchHandle, LaunchRequest, options};
use crate::exec::{CommandOutput, os_args};

const DRY_RUN_MARKER: &str = "DryRunOperation";

#[derive(Debug, Deserialize)]
struct Ec2Options {
    image_id: String,
    instance_type: String,
    key_name: String,
    security_group: String,
    #[serde(default)]
    spot_price: Option<serde_yaml::Value>,
    #[serde(default)]
    iam_instance_profile_arn: Option<String>,
    #[serde(default)]
    availability_zone: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    dry: bool,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

/// Converts `snake_case` to `CamelCase`, as EC2 tag keys conventionally are.
#[must_use]
pub fn snake_to_camel(word: &str) -> String {
    word.split('_')
        .map(|part| {
            let mut chars = part.chars();
            chars.next().map_or_else(
                || String::from("_"),
                |first| first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
            )
        })
        .collect()
}

impl Ec2Options {
    fn spot_price(&self) -> Option<String> {
        self.spot_price.as_ref().map(|price| match price {
            serde_yaml::Value::String(text) => text.clone(),
            other => serde_yaml::to_string(other)
                .map(|text| text.trim().to_owned())
                .unwrap_or_default(),
        })
    }

    fn tags(&self) -> Vec<Json> {
        let mut tags: BTreeMap<String, String> = self
            .tags
            .iter()
            .map(|(key, value)| (snake_to_camel(key), value.clone()))
            .collect();
        if let Some(ref name) = self.name {
            tags.insert(String::from("Name"), name.clone());
        }
        tags.into_iter()
            .map(|(key, value)| json!({ "Key": key, "Value": value }))
            .collect()
    }

    fn launch_specification(&self, user_data: String) -> Json {
        let mut spec = json!({
            "ImageId": self.image_id,
            "KeyName": self.key_name,
            "InstanceType": self.instance_type,
            "SecurityGroups": [self.security_group],
            "UserData": user_data,
        });
        if let Some(map) = spec.as_object_mut() {
            if let Some(ref arn) = self.iam_instance_profile_arn {
                map.insert(String::from("IamInstanceProfile"), json!({ "Arn": arn }));
            }
            if let Some(ref zone) = self.availability_zone {
                map.insert(String::from("Placement"), json!({ "AvailabilityZone": zone }));
            }
        }
        spec
    }
}

#[derive(Clone, Debug)]
struct Ec2Call {
    operation: &'static str,
    input: Json,
}

/// Drives the `aws ec2` CLI.
pub struct Ec2Backend<'a> {
    ctx: BackendContext<'a>,
}

impl<'a> Ec2Backend<'a> {
    /// Creates the adapter.
    #[must_use]
    pub const fn new(ctx: BackendContext<'a>) -> Self {
        Self { ctx }
    }

    fn call(
        &self,
        operation: &str,
        input: &Json,
        region: Option<&str>,
    ) -> Result<CommandOutput, BackendError> {
        let body = serde_json::to_string(input).map_err(|err| BackendError::Encode {
            message: err.to_string(),
        })?;
        let mut args = os_args(["ec2", operation, "--cli-input-json", body.as_str(), "--output", "json"]);
        if let Some(region) = region {
            args.extend(os_args(["--region", region]));
        }
        Ok(self.ctx.runner.run(&self.ctx.settings.aws_bin, &args)?)
    }

    fn execute(&self, request: &LaunchRequest) -> Result<LaunchHandle, BackendError> {
        let opts: Ec2Options = options(&request.config)?;
        let call = build_call(&opts, &request.script);
        let region = opts.region.as_deref();
        let output = self.call(call.operation, &call.input, region)?;

        if !output.is_success() {
            if opts.dry && output.stderr.contains(DRY_RUN_MARKER) {
                info!(operation = call.operation, "dry run validated by EC2");
                return Ok(LaunchHandle::DryRun(vec![output.stderr.trim().to_owned()]));
            }
            return Err(BackendError::Provider {
                program: format!("aws ec2 {}", call.operation),
                status: output.status_text(),
                stderr: output.stderr.trim().to_owned(),
            });
        }

        let response: Json = serde_json::from_str(&output.stdout).map_err(|err| BackendError::Encode {
            message: err.to_string(),
        })?;
        let spot = opts.spot_price.is_some();
        let id = extract_id(&response, spot).ok_or_else(|| BackendError::Provider {
            program: format!("aws ec2 {}", call.operation),
            status: output.status_text(),
            stderr: format!("response carries no identifier: {response}"),
        })?;

        let tags = opts.tags();
        if !tags.is_empty() {
            let input = json!({ "Resources": [&id], "Tags": tags, "DryRun": opts.dry });
            let tagged = self.call("create-tags", &input, region)?;
            if !tagged.is_success() {
                return Err(BackendError::Provider {
                    program: String::from("aws ec2 create-tags"),
                    status: tagged.status_text(),
                    stderr: tagged.stderr.trim().to_owned(),
                });
            }
        }

        if spot {
            info!(request = %id, "made spot instance request");
            Ok(LaunchHandle::SpotRequest(id))
        } else {
            info!(instance = %id, "launched instance");
            Ok(LaunchHandle::Instance(id))
        }
    }
}

/// Builds the EC2 call for `script`.
///
/// Spot requests carry base64 user data; `run-instances` receives the
/// script as text and the CLI encodes it.
fn build_call(opts: &Ec2Options, script: &str) -> Ec2Call {
    match opts.spot_price() {
        Some(price) => {
            let spec = opts.launch_specification(STANDARD.encode(script));
            Ec2Call {
                operation: "request-spot-instances",
                input: json!({
                    "InstanceCount": 1,
                    "SpotPrice": price,
                    "LaunchSpecification": spec,
                    "DryRun": opts.dry,
                }),
            }
        }
        None => {
            let mut input = opts.launch_specification(script.to_owned());
            if let Some(map) = input.as_object_mut() {
                map.insert(String::from("MinCount"), json!(1));
                map.insert(String::from("MaxCount"), json!(1));
                map.insert(String::from("DryRun"), json!(opts.dry));
            }
            Ec2Call {
                operation: "run-instances",
                input,
            }
        }
    }
}

fn extract_id(response: &Json, spot: bool) -> Option<String> {
    let (list, field) = if spot {
        ("SpotInstanceRequests", "SpotInstanceRequestId")
    } else {
        ("Instances", "InstanceId")
    };
    response
        .get(list)?
        .get(0)?
        .get(field)?
        .as_str()
        .map(ToOwned::to_owned)
}

impl Backend for Ec2Backend<'_> {
    fn launch<'a>(&'a self, request: &'a LaunchRequest) -> BackendFuture<'a, LaunchHandle> {
        Box::pin(async move { self.execute(request) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn opts(text: &str) -> Ec2Options {
        serde_yaml::from_str(text).expect("options parse")
    }

    const BASE: &str = "image_id: ami-1\ninstance_type: p3.2xlarge\nkey_name: key\nsecurity_group: sg\n";

    #[rstest]
    #[case("project_name", "ProjectName")]
    #[case("owner", "Owner")]
    #[case("a__b", "A_B")]
    fn snake_keys_become_camel_case(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(snake_to_camel(input), expected);
    }

    #[test]
    fn on_demand_calls_send_the_script_as_text() {
        let call = build_call(&opts(BASE), "echo hi");

        assert_eq!(call.operation, "run-instances");
        assert_eq!(call.input["UserData"], json!("echo hi"));
        assert_eq!(call.input["MinCount"], json!(1));
        assert_eq!(call.input["SecurityGroups"], json!(["sg"]));
        assert!(call.input.get("Placement").is_none());
    }

    #[test]
    fn spot_calls_encode_user_data() {
        let text = format!("{BASE}spot_price: 0.47\navailability_zone: us-west-2a\n");

        let call = build_call(&opts(&text), "echo hi");

        assert_eq!(call.operation, "request-spot-instances");
        assert_eq!(call.input["SpotPrice"], json!("0.47"));
        let spec = &call.input["LaunchSpecification"];
        assert_eq!(spec["UserData"], json!(STANDARD.encode("echo hi")));
        assert_eq!(spec["Placement"]["AvailabilityZone"], json!("us-west-2a"));
    }

    #[test]
    fn name_becomes_the_name_tag() {
        let text = format!("{BASE}name: sweep\ntags:\n  project_name: sortie\n");

        let tags = opts(&text).tags();

        assert_eq!(
            tags,
            vec![
                json!({ "Key": "Name", "Value": "sweep" }),
                json!({ "Key": "ProjectName", "Value": "sortie" }),
            ]
        );
    }

    #[rstest]
    #[case(json!({ "Instances": [{ "InstanceId": "i-1" }] }), false, Some("i-1"))]
    #[case(json!({ "SpotInstanceRequests": [{ "SpotInstanceRequestId": "sir-1" }] }), true, Some("sir-1"))]
    #[case(json!({ "Instances": [] }), false, None)]
    fn identifiers_are_extracted(#[case] response: Json, #[case] spot: bool, #[case] id: Option<&str>) {
        assert_eq!(extract_id(&response, spot).as_deref(), id);
    }
}
