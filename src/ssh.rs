//! SSH target description and argument builders shared by the SSH mount and
//! the SSH backend.

use std::ffi::OsString;

use serde::Deserialize;
use shell_escape::unix::escape;

use crate::settings::Settings;

const DEFAULT_SSH_USER: &str = "ubuntu";

/// Connection details for an SSH reachable host.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct SshTarget {
    /// Hostname or IP address.
    pub ip: String,
    /// TCP port; the client default is used when absent.
    #[serde(default)]
    pub port: Option<u16>,
    /// Remote user to connect as.
    #[serde(default = "default_user")]
    pub username: String,
    /// Private key file. Supports tilde expansion.
    #[serde(default)]
    pub pem: Option<String>,
    /// Password used through `sshpass` when no key file is configured.
    #[serde(default)]
    pub password: Option<String>,
}

fn default_user() -> String {
    DEFAULT_SSH_USER.to_owned()
}

impl SshTarget {
    /// Returns `user@host`.
    #[must_use]
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.ip)
    }

    /// Builds the `(program, args)` pair for running `ssh` with the given
    /// trailing arguments, wrapping the call with `sshpass` for passwords.
    #[must_use]
    pub fn ssh_command(&self, settings: &Settings, trailing: &[OsString]) -> (String, Vec<OsString>) {
        let mut args = self.common_options(settings, "-p");
        args.push(OsString::from(self.destination()));
        args.extend_from_slice(trailing);
        self.with_password(settings, &settings.ssh_bin, args)
    }

    /// Builds the `(program, args)` pair copying `local` to `remote` on the
    /// target with `scp`.
    #[must_use]
    pub fn scp_command(&self, settings: &Settings, local: &str, remote: &str) -> (String, Vec<OsString>) {
        let mut args = self.common_options(settings, "-P");
        args.push(OsString::from(local));
        args.push(OsString::from(format!("{}:{remote}", self.destination())));
        self.with_password(settings, &settings.scp_bin, args)
    }

    fn common_options(&self, settings: &Settings, port_flag: &str) -> Vec<OsString> {
        let mut args = Vec::new();
        if let Some(port) = self.port {
            args.push(OsString::from(port_flag));
            args.push(OsString::from(port.to_string()));
        }

        if let Some(ref pem) = self.pem {
            args.push(OsString::from("-i"));
            args.push(OsString::from(expand_tilde(pem)));
        }

        if self.password.is_none() {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }

        if !settings.ssh_strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !settings.ssh_known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                settings.ssh_known_hosts_file
            )));
        }

        args
    }

    fn with_password(
        &self,
        settings: &Settings,
        program: &str,
        args: Vec<OsString>,
    ) -> (String, Vec<OsString>) {
        match self.password {
            Some(ref password) if self.pem.is_none() => {
                let mut wrapped = vec![
                    OsString::from("-p"),
                    OsString::from(password),
                    OsString::from(program),
                ];
                wrapped.extend(args);
                (settings.sshpass_bin.clone(), wrapped)
            }
            _ => (program.to_owned(), args),
        }
    }
}

/// Renders a `(program, args)` pair as a shell-escaped command line, used
/// for dry runs and diagnostics.
#[must_use]
pub fn render_command(program: &str, args: &[OsString]) -> String {
    let mut parts = vec![escape(program.into()).into_owned()];
    parts.extend(
        args.iter()
            .map(|arg| escape(arg.to_string_lossy()).into_owned()),
    );
    parts.join(" ")
}

/// Expands a leading `~/` prefix to the user's home directory.
///
/// If `HOME` is not set the input is returned unchanged.
///
/// # Examples
///
/// ```
/// # use sortie::ssh::expand_tilde;
/// assert_eq!(expand_tilde("/absolute/path"), "/absolute/path");
/// ```
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn target() -> SshTarget {
        SshTarget {
            ip: String::from("10.0.0.5"),
            port: Some(2222),
            username: String::from("ubuntu"),
            pem: Some(String::from("/keys/id")),
            password: None,
        }
    }

    fn strings(args: &[OsString]) -> Vec<String> {
        args.iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[rstest]
    fn ssh_command_uses_lowercase_port_and_identity(target: SshTarget) {
        let (program, args) =
            target.ssh_command(&Settings::default(), &[OsString::from("bash -s")]);
        let rendered = strings(&args);

        assert_eq!(program, "ssh");
        assert_eq!(rendered.get(..4), Some(&["-p", "2222", "-i", "/keys/id"].map(String::from)[..]));
        assert_eq!(rendered.last().map(String::as_str), Some("bash -s"));
        assert!(rendered.contains(&String::from("ubuntu@10.0.0.5")));
    }

    #[rstest]
    fn scp_command_uses_uppercase_port(target: SshTarget) {
        let (program, args) = target.scp_command(&Settings::default(), "/tmp/a.sh", "/tmp/b.sh");
        let rendered = strings(&args);

        assert_eq!(program, "scp");
        assert!(rendered.contains(&String::from("-P")));
        assert_eq!(
            rendered.last().map(String::as_str),
            Some("ubuntu@10.0.0.5:/tmp/b.sh")
        );
    }

    #[rstest]
    fn password_login_wraps_with_sshpass(target: SshTarget) {
        let password_target = SshTarget {
            pem: None,
            password: Some(String::from("hunter2")),
            ..target
        };
        let (program, args) = password_target.ssh_command(&Settings::default(), &[]);
        let rendered = strings(&args);

        assert_eq!(program, "sshpass");
        assert_eq!(rendered.get(..3), Some(&["-p", "hunter2", "ssh"].map(String::from)[..]));
        assert!(!rendered.contains(&String::from("BatchMode=yes")));
    }

    #[test]
    fn render_command_escapes_arguments() {
        let rendered = render_command("ssh", &[OsString::from("a b"), OsString::from("c")]);
        assert_eq!(rendered, "ssh 'a b' c");
    }
}
