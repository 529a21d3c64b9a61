//! Rsync command line builder.

use crate::error::{MigrateError, MigrateResult};

/// SSH user used when none is configured.
pub const DEFAULT_SSH_USER: &str = "root";

/// Structured description of one rsync invocation.
///
/// At most one side may be remote. The remote side is addressed as
/// `<user>@<host>:<path>` through the ssh command passed with `-e`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RsyncCommand {
    /// Source path.
    pub src_path: String,
    /// Destination path.
    pub dest_path: String,
    /// Reach the source over SSH.
    pub src_use_ssh: bool,
    /// Reach the destination over SSH.
    pub dest_use_ssh: bool,
    /// Source SSH host.
    pub src_ssh_host: Option<String>,
    /// Source SSH user.
    pub src_ssh_user: Option<String>,
    /// Destination SSH host.
    pub dest_ssh_host: Option<String>,
    /// Destination SSH user.
    pub dest_ssh_user: Option<String>,
    /// SSH port; `None` or `0` leaves the ssh default.
    pub port: Option<u16>,
    /// Private key passed to ssh with `-i`.
    pub identity_file: Option<String>,
    /// Skip owner and group preservation.
    pub no_chown: bool,
    /// Delete extraneous files on the destination.
    pub delete: bool,
    /// Compress in transit.
    pub compress: bool,
}

impl RsyncCommand {
    /// Creates a local-to-local command.
    #[must_use]
    pub fn new(src_path: impl Into<String>, dest_path: impl Into<String>) -> Self {
        Self {
            src_path: src_path.into(),
            dest_path: dest_path.into(),
            ..Default::default()
        }
    }

    /// Pulls the source from `host` over SSH.
    #[must_use]
    pub fn with_ssh_source(mut self, host: impl Into<String>) -> Self {
        self.src_use_ssh = true;
        self.src_ssh_host = Some(host.into());
        self
    }

    /// Pushes to the destination on `host` over SSH.
    #[must_use]
    pub fn with_ssh_dest(mut self, host: impl Into<String>) -> Self {
        self.dest_use_ssh = true;
        self.dest_ssh_host = Some(host.into());
        self
    }

    /// Sets the SSH port.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Authenticates with the private key at `path`.
    #[must_use]
    pub fn with_identity_file(mut self, path: impl Into<String>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    /// Sets the transfer flags.
    #[must_use]
    pub const fn with_flags(mut self, no_chown: bool, delete: bool, compress: bool) -> Self {
        self.no_chown = no_chown;
        self.delete = delete;
        self.compress = compress;
        self
    }

    /// Renders the command as a single shell line.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::Command`] if both sides request SSH, a remote side has
    /// no host, or a path cannot be shell-quoted.
    pub fn build(&self) -> MigrateResult<String> {
        if self.src_use_ssh && self.dest_use_ssh {
            return Err(MigrateError::Command(
                "cannot use ssh on both source and destination".to_string(),
            ));
        }

        let mut ssh_args = vec![
            "ssh",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "ConnectTimeout=5",
        ];
        if let Some(identity) = self.identity_file.as_deref() {
            ssh_args.extend(["-i", identity]);
        }
        let port = self.port.filter(|p| *p != 0).map(|p| p.to_string());
        if let Some(port) = port.as_deref() {
            ssh_args.extend(["-p", port]);
        }
        let ssh_cmd = format!("\"{}\"", ssh_args.join(" "));

        let mut args = vec![
            "-av",
            "--info=progress2,misc0,flist0",
            "--no-inc-recursive",
            "-e",
            ssh_cmd.as_str(),
        ];
        if self.compress {
            args.push("-z");
        }
        if self.no_chown {
            args.extend(["--no-o", "--no-g"]);
        }
        if self.delete {
            args.push("--delete");
        }

        let src = endpoint(
            self.src_use_ssh,
            self.src_ssh_user.as_deref(),
            self.src_ssh_host.as_deref(),
            &self.src_path,
        )?;
        let dest = endpoint(
            self.dest_use_ssh,
            self.dest_ssh_user.as_deref(),
            self.dest_ssh_host.as_deref(),
            &self.dest_path,
        )?;

        Ok(format!("rsync {} {src} {dest}", args.join(" ")))
    }
}

fn endpoint(
    use_ssh: bool,
    user: Option<&str>,
    host: Option<&str>,
    path: &str,
) -> MigrateResult<String> {
    if !use_ssh {
        return quote(path);
    }
    let host = host
        .filter(|h| !h.is_empty())
        .ok_or_else(|| MigrateError::Command("ssh endpoint requires a host".to_string()))?;
    let user = user.filter(|u| !u.is_empty()).unwrap_or(DEFAULT_SSH_USER);
    quote(&format!("{user}@{host}:{path}"))
}

fn quote(word: &str) -> MigrateResult<String> {
    shlex::try_quote(word)
        .map(std::borrow::Cow::into_owned)
        .map_err(|e| MigrateError::Command(format!("{word:?}: {e}")))
}
