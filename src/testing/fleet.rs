//! In-memory fleet transport for tests

use crate::error::{InstallerError, Result};
use crate::shell::{RemoteTransport, SshClient};
use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, LazyLock};

const LISTENING_PORTS_CMD: &str =
    r"netstat -ln4 | sed 1,2d | sed 's/\s\s*/ /g' | cut -d ' ' -f 4 | cut -d ':' -f 2";

static UNIT_PORT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^Environment=(?:CLIENT|MESSAGING)_PORT=(\d+)$").expect("port regex is valid")
});

#[derive(Default)]
struct HostState {
    machine_id: String,
    files: BTreeMap<String, String>,
    dirs: BTreeSet<String>,
    services: BTreeMap<String, bool>,
    extra_listening: BTreeSet<u16>,
}

#[derive(Default)]
struct FleetState {
    hosts: BTreeMap<String, HostState>,
    stubs: BTreeMap<String, VecDeque<String>>,
    recordings: Vec<String>,
    stores: BTreeMap<String, BTreeMap<String, String>>,
}

impl FleetState {
    fn host_mut(&mut self, host: &str) -> &mut HostState {
        let next_id = format!("machine-{}", self.hosts.len() + 1);
        self.hosts.entry(host.to_string()).or_insert_with(|| HostState {
            machine_id: next_id,
            ..HostState::default()
        })
    }
}

fn command_failed(command: &str, stderr: &str) -> InstallerError {
    InstallerError::CommandFailed {
        command: command.to_string(),
        exit_code: 1,
        stderr: stderr.to_string(),
    }
}

fn insert_dir_with_parents(dirs: &mut BTreeSet<String>, path: &str) {
    let path = path.trim_end_matches('/');
    let mut current = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);
        dirs.insert(current.clone());
    }
}

/// Cluster name embedded in an engine config reference
fn cluster_from_ref(config_ref: &str) -> Option<String> {
    if let Some(rest) = config_ref.split("key=/ovs/arakoon/").nth(1) {
        return rest.strip_suffix("/config").map(str::to_string);
    }
    config_ref
        .strip_prefix("/opt/OpenvStorage/config/arakoon_")
        .and_then(|rest| rest.strip_suffix(".ini"))
        .map(str::to_string)
}

/// Deterministic in-memory fleet.
///
/// Implements [`RemoteTransport`] with a per-host filesystem, machine ids
/// and a service table, plus built-in emulation of the commands the
/// installers issue: the listening-ports pipeline, the ephemeral-range
/// read, `systemctl` verbs and the `arakoon` engine CLI (one shared
/// key/value store per cluster, healthy once a member service runs).
///
/// Anything else must be stubbed with [`MockFleet::stub_command`], keyed by
/// the literal command text; every executed command is recorded for exact
/// assertions.
#[derive(Default)]
pub struct MockFleet {
    state: Mutex<FleetState>,
}

impl MockFleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host with an explicit machine id.
    pub fn add_host(&self, ip: &str, machine_id: &str) {
        let mut state = self.state.lock();
        state.host_mut(ip).machine_id = machine_id.to_string();
    }

    /// Shell client for a host, backed by this fleet.
    pub fn client(self: &Arc<Self>, host: &str) -> SshClient {
        SshClient::new(self.clone(), host)
    }

    /// Stub a command (any host) with a fixed response.
    pub fn stub_command(&self, command: &str, output: &str) {
        let mut state = self.state.lock();
        state
            .stubs
            .insert(command.to_string(), VecDeque::from([output.to_string()]));
    }

    /// Stub a command with successive responses; the last one repeats.
    pub fn stub_command_sequence(&self, command: &str, outputs: &[&str]) {
        let mut state = self.state.lock();
        state.stubs.insert(
            command.to_string(),
            outputs.iter().map(|s| s.to_string()).collect(),
        );
    }

    /// Every command executed so far, in order.
    pub fn recordings(&self) -> Vec<String> {
        self.state.lock().recordings.clone()
    }

    pub fn clear_recordings(&self) {
        self.state.lock().recordings.clear();
    }

    /// Mark a port as listening on a host, outside any service unit.
    pub fn add_listening_port(&self, host: &str, port: u16) {
        let mut state = self.state.lock();
        state.host_mut(host).extra_listening.insert(port);
    }

    /// Content of a file on a host; panics when the file does not exist.
    pub fn file_content(&self, host: &str, path: &str) -> String {
        let state = self.state.lock();
        state
            .hosts
            .get(host)
            .and_then(|h| h.files.get(path))
            .unwrap_or_else(|| panic!("no file {} on {}", path, host))
            .clone()
    }

    pub fn has_file(&self, host: &str, path: &str) -> bool {
        let state = self.state.lock();
        state
            .hosts
            .get(host)
            .map(|h| h.files.contains_key(path))
            .unwrap_or(false)
    }

    /// Running state of a service on a host; `None` when not registered.
    pub fn service_state(&self, host: &str, name: &str) -> Option<bool> {
        let state = self.state.lock();
        let host_state = state.hosts.get(host)?;
        if !host_state
            .files
            .contains_key(&format!("/lib/systemd/system/{}.service", name))
        {
            return None;
        }
        Some(host_state.services.get(name).copied().unwrap_or(false))
    }

    /// Value stored in a cluster's engine under `key`.
    pub fn engine_value(&self, cluster_name: &str, key: &str) -> Option<String> {
        let state = self.state.lock();
        state
            .stores
            .get(cluster_name)
            .and_then(|store| store.get(key))
            .cloned()
    }

    /// Snapshot of the directory tree under `root` on a host, as nested
    /// `{"files": [...], "dirs": {...}}` objects.
    pub fn dir_structure(&self, host: &str, root: &str) -> Value {
        let state = self.state.lock();
        match state.hosts.get(host) {
            Some(host_state) => build_structure(host_state, root.trim_end_matches('/')),
            None => json!({"files": [], "dirs": {}}),
        }
    }

    fn execute(&self, host: &str, command: &str, stdin: Option<&[u8]>) -> Result<String> {
        let mut state = self.state.lock();
        state.recordings.push(command.to_string());

        if let Some(queue) = state.stubs.get_mut(command) {
            let output = if queue.len() > 1 {
                queue.pop_front().unwrap_or_default()
            } else {
                queue.front().cloned().unwrap_or_default()
            };
            return Ok(output);
        }

        if command == "cat /etc/openvstorage_id" {
            let machine_id = state.host_mut(host).machine_id.clone();
            return Ok(format!("{}\n", machine_id));
        }
        if command == LISTENING_PORTS_CMD {
            let host_state = state.host_mut(host);
            let mut ports: BTreeSet<u16> = host_state.extra_listening.clone();
            for (path, content) in &host_state.files {
                if path.starts_with("/lib/systemd/system/") {
                    for capture in UNIT_PORT_REGEX.captures_iter(content) {
                        if let Ok(port) = capture[1].parse::<u16>() {
                            ports.insert(port);
                        }
                    }
                }
            }
            return Ok(ports
                .iter()
                .map(|port| format!("{}\n", port))
                .collect::<String>());
        }
        if command == "cat /proc/sys/net/ipv4/ip_local_port_range" {
            return Ok("32768\t61000\n".to_string());
        }
        if command == "systemctl daemon-reload" {
            return Ok(String::new());
        }
        if let Some(name) = command.strip_prefix("systemctl start ") {
            return set_service(state.host_mut(host), command, name, true);
        }
        if let Some(name) = command.strip_prefix("systemctl restart ") {
            return set_service(state.host_mut(host), command, name, true);
        }
        if let Some(name) = command.strip_prefix("systemctl stop ") {
            return set_service(state.host_mut(host), command, name, false);
        }
        if let Some(rest) = command.strip_prefix("systemctl is-active ") {
            let name = rest.strip_suffix(" || true").unwrap_or(rest);
            let active = state
                .host_mut(host)
                .services
                .get(name)
                .copied()
                .unwrap_or(false);
            return Ok(format!("{}\n", if active { "active" } else { "inactive" }));
        }
        if let Some(rest) = command.strip_prefix("arakoon -config ") {
            return engine_command(&mut state, command, rest, stdin);
        }

        Err(InstallerError::CommandFailed {
            command: command.to_string(),
            exit_code: 127,
            stderr: "command not stubbed".to_string(),
        })
    }
}

fn set_service(
    host_state: &mut HostState,
    command: &str,
    name: &str,
    running: bool,
) -> Result<String> {
    let unit = format!("/lib/systemd/system/{}.service", name);
    if !host_state.files.contains_key(&unit) {
        return Err(command_failed(
            command,
            &format!("Unit {}.service not found.", name),
        ));
    }
    host_state.services.insert(name.to_string(), running);
    Ok(String::new())
}

fn engine_command(
    state: &mut FleetState,
    command: &str,
    rest: &str,
    stdin: Option<&[u8]>,
) -> Result<String> {
    let (config_ref, operation) = rest
        .split_once(" --")
        .ok_or_else(|| command_failed(command, "unparsable engine command"))?;
    let cluster = cluster_from_ref(config_ref)
        .ok_or_else(|| command_failed(command, "unparsable config reference"))?;

    if operation == "who-master" {
        let service = format!("arakoon-{}", cluster);
        let healthy = state
            .hosts
            .values()
            .any(|host| host.services.get(&service).copied().unwrap_or(false));
        return if healthy {
            Ok("master\n".to_string())
        } else {
            Err(command_failed(command, "no master elected"))
        };
    }

    let (verb, key) = operation
        .split_once(' ')
        .ok_or_else(|| command_failed(command, "missing key"))?;
    let store = state.stores.entry(cluster).or_default();
    match verb {
        "get" => store
            .get(key)
            .cloned()
            .ok_or_else(|| command_failed(command, "key not found")),
        "set" => {
            let value = String::from_utf8_lossy(stdin.unwrap_or_default()).into_owned();
            store.insert(key.to_string(), value);
            Ok(String::new())
        }
        "exists" => Ok(format!("{}\n", store.contains_key(key))),
        "delete" => match store.remove(key) {
            Some(_) => Ok(String::new()),
            None => Err(command_failed(command, "key not found")),
        },
        _ => Err(command_failed(command, "unknown engine verb")),
    }
}

fn build_structure(host_state: &HostState, root: &str) -> Value {
    let mut files: Vec<Value> = Vec::new();
    for path in host_state.files.keys() {
        if let Some((parent, name)) = path.rsplit_once('/') {
            if parent == root {
                files.push(Value::String(name.to_string()));
            }
        }
    }
    let mut dirs = Map::new();
    for path in &host_state.dirs {
        if let Some((parent, name)) = path.rsplit_once('/') {
            if parent == root {
                dirs.insert(name.to_string(), build_structure(host_state, path));
            }
        }
    }
    json!({"files": files, "dirs": dirs})
}

#[async_trait]
impl RemoteTransport for MockFleet {
    async fn exec(
        &self,
        host: &str,
        _user: &str,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> Result<String> {
        self.execute(host, command, stdin)
    }

    async fn file_read(&self, host: &str, _user: &str, path: &str) -> Result<String> {
        let mut state = self.state.lock();
        state
            .host_mut(host)
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| command_failed(&format!("cat {}", path), "No such file or directory"))
    }

    async fn file_write(
        &self,
        host: &str,
        _user: &str,
        path: &str,
        content: &str,
        _mode: Option<u32>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let host_state = state.host_mut(host);
        if let Some((parent, _)) = path.rsplit_once('/') {
            insert_dir_with_parents(&mut host_state.dirs, parent);
        }
        host_state.files.insert(path.to_string(), content.to_string());
        Ok(())
    }

    async fn file_upload(&self, host: &str, user: &str, remote: &str, local: &str) -> Result<()> {
        let content = tokio::fs::read_to_string(local)
            .await
            .map_err(|e| InstallerError::Connection(format!("Failed to read {}: {}", local, e)))?;
        self.file_write(host, user, remote, &content, None).await
    }

    async fn file_exists(&self, host: &str, _user: &str, path: &str) -> Result<bool> {
        let mut state = self.state.lock();
        let host_state = state.host_mut(host);
        Ok(host_state.files.contains_key(path) || host_state.dirs.contains(path))
    }

    async fn file_delete(&self, host: &str, _user: &str, path: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.host_mut(host).files.remove(path);
        Ok(())
    }

    async fn dir_create(&self, host: &str, _user: &str, paths: &[String]) -> Result<()> {
        let mut state = self.state.lock();
        let host_state = state.host_mut(host);
        for path in paths {
            insert_dir_with_parents(&mut host_state.dirs, path);
        }
        Ok(())
    }

    async fn dir_delete(&self, host: &str, _user: &str, paths: &[String]) -> Result<()> {
        let mut state = self.state.lock();
        let host_state = state.host_mut(host);
        for path in paths {
            let path = path.trim_end_matches('/');
            let subtree = format!("{}/", path);
            host_state
                .dirs
                .retain(|dir| dir != path && !dir.starts_with(&subtree));
            host_state
                .files
                .retain(|file, _| !file.starts_with(&subtree));
        }
        Ok(())
    }

    async fn dir_chmod(
        &self,
        host: &str,
        _user: &str,
        _paths: &[String],
        _mode: u32,
        _recursive: bool,
    ) -> Result<()> {
        self.state.lock().host_mut(host);
        Ok(())
    }

    async fn dir_chown(
        &self,
        host: &str,
        _user: &str,
        _paths: &[String],
        _owner: &str,
        _group: &str,
        _recursive: bool,
    ) -> Result<()> {
        self.state.lock().host_mut(host);
        Ok(())
    }
}
