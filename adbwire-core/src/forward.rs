//! Forward and reverse port rules.
//!
//! Forward rules live in the server (`host-serial:<serial>:forward...`);
//! reverse rules live on the device and are managed over a device-bound
//! connection (`reverse:forward...`). Removing a rule that does not exist is
//! not an error unless strict mode is requested.

use crate::client::{AdbClient, AdbDevice, Reply};
use crate::error::{AdbError, Result};
use crate::request::{DeviceRequest, HostRequest};
use crate::types::{Endpoint, ForwardRule, ReverseRule, parse_rule_lines};

fn parse_port(reply: Reply) -> Result<Option<u16>> {
    match reply {
        Reply::Text(text) => {
            let port = text
                .trim()
                .parse()
                .map_err(|_| AdbError::protocol(format!("invalid allocated port {text:?}")))?;
            Ok(Some(port))
        }
        _ => Ok(None),
    }
}

fn lenient<T>(result: Result<T>, strict: bool, what: &str) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(AdbError::Service(msg)) if !strict => {
            tracing::warn!(%msg, "{what} failed; ignoring");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

// ── Forward rules ────────────────────────────────────────────────

impl AdbClient {
    /// All forward rules, or only those of `serial`.
    pub async fn forward_list(&self, serial: Option<&str>) -> Result<Vec<ForwardRule>> {
        let request = HostRequest::ListForward {
            serial: serial.map(str::to_string),
        };
        let text = self.open_host_request(&request).await?.into_text();
        Ok(parse_rule_lines(&text)
            .into_iter()
            .map(|(serial, local, remote)| ForwardRule {
                serial,
                local,
                remote,
            })
            .collect())
    }

    /// Add a forward rule. For `tcp:0` the server allocates a port, which
    /// is returned.
    pub async fn forward(
        &self,
        serial: &str,
        local: &Endpoint,
        remote: &Endpoint,
        norebind: bool,
    ) -> Result<Option<u16>> {
        let request = HostRequest::Forward {
            serial: serial.to_string(),
            local: local.clone(),
            remote: remote.clone(),
            norebind,
        };
        let port = parse_port(self.open_host_request(&request).await?)?;
        tracing::debug!(serial, %local, %remote, ?port, "forward added");
        Ok(port)
    }

    /// Remove the forward rule listening on `local`.
    pub async fn forward_remove(&self, serial: &str, local: &Endpoint, strict: bool) -> Result<()> {
        let request = HostRequest::KillForward {
            serial: serial.to_string(),
            local: local.clone(),
        };
        lenient(self.open_host_request(&request).await, strict, "killforward")
    }

    /// Remove every forward rule of `serial`.
    pub async fn forward_remove_all(&self, serial: &str, strict: bool) -> Result<()> {
        let request = HostRequest::KillForwardAll {
            serial: serial.to_string(),
        };
        lenient(self.open_host_request(&request).await, strict, "killforward-all")
    }
}

impl AdbDevice {
    /// Forward rules belonging to this device.
    pub async fn forward_list(&self) -> Result<Vec<ForwardRule>> {
        let serial = self.resolve_serial().await?;
        let rules = self.client.forward_list(Some(&serial)).await?;
        Ok(rules.into_iter().filter(|r| r.serial == serial).collect())
    }

    pub async fn forward(
        &self,
        local: &Endpoint,
        remote: &Endpoint,
        norebind: bool,
    ) -> Result<Option<u16>> {
        let serial = self.resolve_serial().await?;
        self.client.forward(&serial, local, remote, norebind).await
    }

    pub async fn forward_remove(&self, local: &Endpoint, strict: bool) -> Result<()> {
        let serial = self.resolve_serial().await?;
        self.client.forward_remove(&serial, local, strict).await
    }

    pub async fn forward_remove_all(&self, strict: bool) -> Result<()> {
        let serial = self.resolve_serial().await?;
        self.client.forward_remove_all(&serial, strict).await
    }

    /// A host TCP port forwarded to `remote`, reusing an existing `tcp:`
    /// rule when there is one.
    pub async fn forward_port(&self, remote: &Endpoint) -> Result<u16> {
        for rule in self.forward_list().await? {
            if let (Endpoint::Tcp(port), true) = (&rule.local, &rule.remote == remote) {
                if *port != 0 {
                    tracing::debug!(port, %remote, "reusing forward");
                    return Ok(*port);
                }
            }
        }
        self.forward(&Endpoint::Tcp(0), remote, false)
            .await?
            .ok_or_else(|| AdbError::protocol("server did not report the allocated port"))
    }

    // ── Reverse rules ────────────────────────────────────────────

    /// Reverse rules registered on the device.
    pub async fn reverse_list(&self) -> Result<Vec<ReverseRule>> {
        let text = self
            .client
            .device_request(&self.selector, &DeviceRequest::ReverseList)
            .await?
            .into_text();
        Ok(parse_rule_lines(&text)
            .into_iter()
            .map(|(serial, remote, local)| ReverseRule {
                serial,
                remote,
                local,
            })
            .collect())
    }

    /// Make the device listen on `remote` and tunnel to `local` on the
    /// host. For `tcp:0` the device allocates a port, which is returned.
    pub async fn reverse(
        &self,
        remote: &Endpoint,
        local: &Endpoint,
        norebind: bool,
    ) -> Result<Option<u16>> {
        let request = DeviceRequest::ReverseForward {
            remote: remote.clone(),
            local: local.clone(),
            norebind,
        };
        let reply = self.client.device_request(&self.selector, &request).await?;
        let port = parse_port(reply)?;
        tracing::debug!(device = %self.selector, %remote, %local, ?port, "reverse added");
        Ok(port)
    }

    pub async fn reverse_remove(&self, remote: &Endpoint, strict: bool) -> Result<()> {
        let request = DeviceRequest::ReverseKill(remote.clone());
        lenient(
            self.client.device_request(&self.selector, &request).await,
            strict,
            "reverse killforward",
        )
    }

    pub async fn reverse_remove_all(&self, strict: bool) -> Result<()> {
        lenient(
            self.client
                .device_request(&self.selector, &DeviceRequest::ReverseKillAll)
                .await,
            strict,
            "reverse killforward-all",
        )
    }
}
