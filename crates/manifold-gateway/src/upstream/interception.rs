//! Container-image trust-certificate injection.
//!
//! Backends launched through a container runtime can have the gateway's CA
//! certificate baked into a derived image so intercepted TLS traffic is
//! trusted inside the container. The rewrite is strictly best-effort: any
//! failure - unparseable command line, missing cert, failed build - falls
//! back to the unmodified command rather than blocking backend startup.

use crate::config::InterceptionSettings;
use manifold_core::{GatewayError, GatewayResult};
use std::path::Path;
use tracing::{debug, warn};

const CA_CERT_FILENAME: &str = "manifold-ca.crt";

/// Container runtimes whose `run` invocations we understand.
const CONTAINER_RUNTIMES: &[&str] = &["docker", "podman"];

/// Flags of `docker run` that consume a following value.
const VALUE_FLAGS: &[&str] = &[
    "-e", "--env", "--env-file", "-v", "--volume", "--mount", "-w", "--workdir", "--name",
    "--network", "--net", "-p", "--publish", "--entrypoint", "-l", "--label", "-u", "--user",
    "--platform", "--pull", "--restart", "--hostname", "-h",
];

/// A parsed `run` invocation.
#[derive(Debug, PartialEq, Eq)]
pub struct ParsedRun {
    /// Index of the image reference within the args slice
    pub image_index: usize,
    /// The image reference
    pub image: String,
}

/// Locate the image reference in `docker run`-style args. Returns `None`
/// when the invocation is not a `run` or no image can be identified.
pub fn parse_run_args(args: &[String]) -> Option<ParsedRun> {
    let mut iter = args.iter().enumerate();
    loop {
        let (_, arg) = iter.next()?;
        if arg == "run" {
            break;
        }
        if !arg.starts_with('-') {
            // Some other subcommand; not a run invocation.
            return None;
        }
    }
    let mut skip_value = false;
    for (index, arg) in iter {
        if skip_value {
            skip_value = false;
            continue;
        }
        if arg.starts_with('-') {
            if VALUE_FLAGS.contains(&arg.as_str()) {
                skip_value = true;
            }
            continue;
        }
        return Some(ParsedRun {
            image_index: index,
            image: arg.clone(),
        });
    }
    None
}

fn derived_tag(image: &str) -> String {
    let sanitized: String = image
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '-' })
        .collect();
    format!("manifold-ca/{}", sanitized.to_lowercase())
}

/// Build a derived image with the CA certificate installed and return the
/// rewritten args. Fails rather than falls back; the caller decides what a
/// failure means.
async fn rewrite_args(args: &[String], cert_path: &Path) -> GatewayResult<Vec<String>> {
    tokio::fs::metadata(cert_path).await.map_err(|e| {
        GatewayError::config(format!(
            "CA certificate {} is not accessible: {e}",
            cert_path.display()
        ))
    })?;

    let parsed = parse_run_args(args)
        .ok_or_else(|| GatewayError::config("could not locate image in container run command"))?;

    let build_dir = tempfile::tempdir()
        .map_err(|e| GatewayError::internal(format!("failed to create build dir: {e}")))?;
    tokio::fs::copy(cert_path, build_dir.path().join(CA_CERT_FILENAME))
        .await
        .map_err(|e| GatewayError::internal(format!("failed to stage CA certificate: {e}")))?;

    let dockerfile = format!(
        "FROM {image}\n\
         USER root\n\
         COPY {cert} /usr/local/share/ca-certificates/{cert}\n\
         RUN update-ca-certificates 2>/dev/null \
         || cat /usr/local/share/ca-certificates/{cert} >> /etc/ssl/certs/ca-certificates.crt\n",
        image = parsed.image,
        cert = CA_CERT_FILENAME,
    );
    tokio::fs::write(build_dir.path().join("Dockerfile"), dockerfile)
        .await
        .map_err(|e| GatewayError::internal(format!("failed to write Dockerfile: {e}")))?;

    let tag = derived_tag(&parsed.image);
    let status = tokio::process::Command::new("docker")
        .args(["build", "-q", "-t", &tag, "."])
        .current_dir(build_dir.path())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .map_err(|e| GatewayError::transport(format!("docker build failed to start: {e}")))?;
    if !status.success() {
        return Err(GatewayError::transport(format!(
            "docker build of {tag} exited with {status}"
        )));
    }

    let mut rewritten = args.to_vec();
    rewritten[parsed.image_index] = tag;
    Ok(rewritten)
}

/// Prepare a stdio launch command, rewriting container runs to use the
/// certificate-injected image when interception is enabled. Any rewrite
/// failure falls back to the unmodified command.
pub async fn prepare_command(
    server_name: &str,
    command: &str,
    args: &[String],
    settings: &InterceptionSettings,
) -> (String, Vec<String>) {
    let unchanged = (command.to_owned(), args.to_vec());
    if !settings.enabled || !CONTAINER_RUNTIMES.contains(&command) {
        return unchanged;
    }
    let Some(cert_path) = settings.cert_path.as_deref() else {
        warn!(name = server_name, "interception enabled but no cert path configured");
        return unchanged;
    };
    match rewrite_args(args, Path::new(cert_path)).await {
        Ok(rewritten) => {
            debug!(name = server_name, "container image rewritten with CA certificate");
            (command.to_owned(), rewritten)
        }
        Err(e) => {
            warn!(
                name = server_name,
                error = %e,
                "image interception failed, launching unmodified command"
            );
            unchanged
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn args(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn finds_image_after_value_flags() {
        let parsed = parse_run_args(&args(&[
            "run", "--rm", "-i", "-e", "API_KEY", "--network", "host",
            "ghcr.io/acme/server:1.2", "--serve",
        ]))
        .unwrap();
        assert_eq!(parsed.image, "ghcr.io/acme/server:1.2");
        assert_eq!(parsed.image_index, 7);
    }

    #[test]
    fn equals_style_flags_do_not_consume_the_image() {
        let parsed = parse_run_args(&args(&["run", "--network=host", "alpine:3"]))
            .unwrap();
        assert_eq!(parsed.image, "alpine:3");
    }

    #[test]
    fn non_run_invocations_are_ignored() {
        assert_eq!(parse_run_args(&args(&["build", "-t", "x", "."])), None);
        assert_eq!(parse_run_args(&args(&["run", "--rm", "-e", "ONLY_FLAGS"])), None);
    }

    #[test]
    fn derived_tags_are_stable_and_sane() {
        assert_eq!(
            derived_tag("ghcr.io/acme/server:1.2"),
            "manifold-ca/ghcr.io-acme-server-1.2"
        );
    }

    #[tokio::test]
    async fn disabled_interception_leaves_command_untouched() {
        let settings = InterceptionSettings::default();
        let (command, rewritten) = prepare_command(
            "svc",
            "docker",
            &args(&["run", "--rm", "alpine:3"]),
            &settings,
        )
        .await;
        assert_eq!(command, "docker");
        assert_eq!(rewritten, args(&["run", "--rm", "alpine:3"]));
    }

    #[tokio::test]
    async fn failed_rewrite_falls_back_to_original_command() {
        let settings = InterceptionSettings {
            enabled: true,
            cert_path: Some("/nonexistent/ca.crt".to_owned()),
        };
        let original = args(&["run", "--rm", "alpine:3"]);
        let (command, rewritten) =
            prepare_command("svc", "docker", &original, &settings).await;
        assert_eq!(command, "docker");
        assert_eq!(rewritten, original);
    }

    #[tokio::test]
    async fn non_container_commands_skip_interception_entirely() {
        let settings = InterceptionSettings {
            enabled: true,
            cert_path: Some("/nonexistent/ca.crt".to_owned()),
        };
        let (command, rewritten) =
            prepare_command("svc", "uvx", &args(&["mcp-server-time"]), &settings).await;
        assert_eq!(command, "uvx");
        assert_eq!(rewritten, args(&["mcp-server-time"]));
    }
}
