// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Annotation contract for the cluster admission webhook that injects this
//! sidecar into application pods. Only the shape the webhook and this
//! sidecar must agree on is captured here; the webhook's Kubernetes wiring
//! (decoding `AdmissionReview`, talking to the API server) is an external
//! collaborator, per `SPEC_FULL.md` §1/§10.6.

use serde::{Deserialize, Serialize};

/// Annotation keys a pod spec is inspected for.
pub mod annotation {
    pub const APP: &str = "kar.ibm.com/app";
    pub const SERVICE: &str = "kar.ibm.com/service";
    pub const ACTORS: &str = "kar.ibm.com/actors";
    pub const SEND_PORT: &str = "kar.ibm.com/sendPort";
    pub const RECV_PORT: &str = "kar.ibm.com/recvPort";
    pub const VERBOSE: &str = "kar.ibm.com/verbose";
}

pub const DEFAULT_SEND_PORT: u16 = 8080;
pub const DEFAULT_RECV_PORT: u16 = 3500;
pub const SIDECAR_CONTAINER_NAME: &str = "kar";

/// The subset of a pod's annotations this sidecar's injection depends on.
/// `app` absent means the webhook should leave the pod untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PodAnnotations {
    #[serde(rename = "kar.ibm.com/app")]
    pub app: Option<String>,
    #[serde(rename = "kar.ibm.com/service")]
    pub service: Option<String>,
    #[serde(rename = "kar.ibm.com/actors")]
    pub actors: Option<String>,
    #[serde(rename = "kar.ibm.com/sendPort")]
    pub send_port: Option<u16>,
    #[serde(rename = "kar.ibm.com/recvPort")]
    pub recv_port: Option<u16>,
    #[serde(rename = "kar.ibm.com/verbose")]
    pub verbose: Option<String>,
}

impl PodAnnotations {
    /// Command-line arguments this sidecar should be launched with, derived
    /// from the annotations present on the pod it is injected into.
    pub fn sidecar_args(&self, config_dir: &str) -> Vec<String> {
        let Some(app) = &self.app else { return Vec::new() };
        let mut args = vec![
            "--kubernetes-mode".to_owned(),
            "--config-dir".to_owned(),
            config_dir.to_owned(),
            "--app".to_owned(),
            app.clone(),
        ];
        if let Some(service) = &self.service {
            args.push("--service".to_owned());
            args.push(service.clone());
        }
        if let Some(actors) = &self.actors {
            args.push("--actors".to_owned());
            args.push(actors.clone());
        }
        args.push("--send-port".to_owned());
        args.push(self.send_port.unwrap_or(DEFAULT_SEND_PORT).to_string());
        args.push("--recv-port".to_owned());
        args.push(self.recv_port.unwrap_or(DEFAULT_RECV_PORT).to_string());
        if let Some(verbosity) = &self.verbose {
            args.push("--verbosity".to_owned());
            args.push(verbosity.clone());
        }
        args
    }

    pub fn recv_port(&self) -> u16 {
        self.recv_port.unwrap_or(DEFAULT_RECV_PORT)
    }
}

/// One JSON Patch (RFC 6902) operation, the wire shape the webhook responds
/// with when it decides to inject.
#[derive(Debug, Clone, Serialize)]
pub struct PatchOperation {
    pub op: String,
    pub path: String,
    pub value: serde_json::Value,
}

impl PatchOperation {
    pub fn replace(path: impl Into<String>, value: serde_json::Value) -> Self {
        Self { op: "replace".to_owned(), path: path.into(), value }
    }

    pub fn add(path: impl Into<String>, value: serde_json::Value) -> Self {
        Self { op: "add".to_owned(), path: path.into(), value }
    }
}

/// Describes the sidecar container the webhook should prepend to a pod's
/// container list; shaped so the webhook layer can serialize it directly
/// into the `containers` patch value alongside the pod's existing ones.
#[derive(Debug, Clone, Serialize)]
pub struct SidecarContainerSpec {
    pub name: &'static str,
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub port: u16,
}

impl SidecarContainerSpec {
    pub fn for_pod(annotations: &PodAnnotations, image: &str, config_dir: &str) -> Self {
        Self {
            name: SIDECAR_CONTAINER_NAME,
            image: image.to_owned(),
            command: vec!["/kar/karsidecar".to_owned()],
            args: annotations.sidecar_args(config_dir),
            port: annotations.recv_port(),
        }
    }
}

#[cfg(test)]
#[path = "admission_tests.rs"]
mod tests;
