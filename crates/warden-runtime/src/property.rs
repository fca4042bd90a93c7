//! Typed, validated, persistable per-container attribute store.
//!
//! Every property is declared once in [`schema`]: its value kind, flags,
//! the states in which a client may set it, and its default. The map
//! itself stores only explicit values; reads fall back to the default, so
//! a freshly created container answers every `get` without any storage.
//!
//! Client-facing checks that need tree context (permissions, state gates,
//! hierarchical sums) live in the holder; this module owns parsing,
//! per-value validation, and kv write-through.

use std::collections::BTreeMap;

use warden_common::error::{Result, WardenError};
use warden_common::types::ContainerState;

use crate::kv::KvNode;

/// Property flags.
pub mod flags {
    /// Written through to the kv node and restored after restart.
    pub const PERSISTENT: u32 = 1 << 0;
    /// Only a privileged caller may change it.
    pub const SUPERUSER: u32 = 1 << 1;
    /// May not be changed when the container shares its parent namespace.
    pub const PARENT_RO: u32 = 1 << 2;
    /// Reset when an unprivileged owner starts a VM-like parent.
    pub const OS_MODE: u32 = 1 << 3;
    /// Re-applied to live cgroups when changed on a running container.
    pub const DYNAMIC: u32 = 1 << 4;
    /// Internal bookkeeping, invisible to clients.
    pub const HIDDEN: u32 = 1 << 5;
}

/// Canonical property names.
pub mod names {
    pub const COMMAND: &str = "command";
    pub const CWD: &str = "cwd";
    pub const ROOT: &str = "root";
    pub const ROOT_READONLY: &str = "root_readonly";
    pub const USER: &str = "user";
    pub const GROUP: &str = "group";
    pub const ENV: &str = "env";
    pub const ISOLATE: &str = "isolate";
    pub const STDOUT_PATH: &str = "stdout_path";
    pub const STDERR_PATH: &str = "stderr_path";
    pub const MEMORY_LIMIT: &str = "memory_limit";
    pub const MEMORY_GUARANTEE: &str = "memory_guarantee";
    pub const RECHARGE_ON_PGFAULT: &str = "recharge_on_pgfault";
    pub const CPU_POLICY: &str = "cpu_policy";
    pub const CPU_LIMIT: &str = "cpu_limit";
    pub const CPU_GUARANTEE: &str = "cpu_guarantee";
    pub const IO_POLICY: &str = "io_policy";
    pub const IO_LIMIT: &str = "io_limit";
    pub const NET_GUARANTEE: &str = "net_guarantee";
    pub const NET_LIMIT: &str = "net_limit";
    pub const NET_PRIORITY: &str = "net_priority";
    pub const RESPAWN: &str = "respawn";
    pub const MAX_RESPAWNS: &str = "max_respawns";
    pub const AGING_TIME: &str = "aging_time";
    pub const ALLOWED_DEVICES: &str = "allowed_devices";
    pub const CAPABILITIES: &str = "capabilities";
    pub const ULIMIT: &str = "ulimit";
    pub const BIND: &str = "bind";
    pub const HOSTNAME: &str = "hostname";
    pub const VIRT_MODE: &str = "virt_mode";
    pub const WARDEN_NAMESPACE: &str = "warden_namespace";
    pub const ENABLE_WARDEN: &str = "enable_warden";
    pub const RAW_NAME: &str = "raw_name";
    pub const RAW_ID: &str = "raw_id";
    pub const RAW_ROOT_PID: &str = "raw_root_pid";
    pub const RAW_LOOP_DEV: &str = "raw_loop_dev";
}

/// Canonical data names.
pub mod data {
    pub const STATE: &str = "state";
    pub const EXIT_STATUS: &str = "exit_status";
    pub const START_ERRNO: &str = "start_errno";
    pub const OOM_KILLED: &str = "oom_killed";
    pub const RESPAWN_COUNT: &str = "respawn_count";
    pub const ROOT_PID: &str = "root_pid";
    pub const DEATH_TIME: &str = "death_time";
    pub const STDOUT: &str = "stdout";
    pub const STDERR: &str = "stderr";
    pub const MEMORY_USAGE: &str = "memory_usage";
    pub const CPU_USAGE: &str = "cpu_usage";
    pub const PARENT: &str = "parent";
    pub const CHILDREN: &str = "children";
}

/// The type of a property or data value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Str,
    Bool,
    Int,
    Uint,
    List,
    UintMap,
}

/// A typed value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Bool(bool),
    Int(i64),
    Uint(u64),
    List(Vec<String>),
    UintMap(BTreeMap<String, u64>),
}

impl Value {
    /// The kind of this value.
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Str(_) => ValueKind::Str,
            Self::Bool(_) => ValueKind::Bool,
            Self::Int(_) => ValueKind::Int,
            Self::Uint(_) => ValueKind::Uint,
            Self::List(_) => ValueKind::List,
            Self::UintMap(_) => ValueKind::UintMap,
        }
    }

    /// Parses the client string form of a value of the given kind.
    ///
    /// # Errors
    ///
    /// Returns `invalid-value` describing the parse failure.
    pub fn parse(kind: ValueKind, text: &str) -> Result<Self> {
        let text = text.trim();
        match kind {
            ValueKind::Str => Ok(Self::Str(text.to_string())),
            ValueKind::Bool => match text {
                "true" | "1" => Ok(Self::Bool(true)),
                "false" | "0" => Ok(Self::Bool(false)),
                _ => Err(WardenError::InvalidValue(format!(
                    "expected boolean, got {text:?}"
                ))),
            },
            ValueKind::Int => text.parse::<i64>().map(Self::Int).map_err(|_| {
                WardenError::InvalidValue(format!("expected integer, got {text:?}"))
            }),
            ValueKind::Uint => parse_size(text).map(Self::Uint),
            ValueKind::List => Ok(Self::List(
                text.split(';')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            )),
            ValueKind::UintMap => {
                let mut map = BTreeMap::new();
                for pair in text.split(';').map(str::trim).filter(|s| !s.is_empty()) {
                    let (key, value) = pair.split_once(':').ok_or_else(|| {
                        WardenError::InvalidValue(format!("expected key: value, got {pair:?}"))
                    })?;
                    map.insert(key.trim().to_string(), parse_size(value.trim())?);
                }
                Ok(Self::UintMap(map))
            }
        }
    }

    /// Unsigned view of the value, when it has one.
    #[must_use]
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Self::Uint(v) => Some(*v),
            Self::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Boolean view of the value, when it has one.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// String view of the value, when it is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    /// The canonical string form, also used for persistence.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Str(v) => f.write_str(v),
            Self::Bool(v) => f.write_str(if *v { "true" } else { "false" }),
            Self::Int(v) => write!(f, "{v}"),
            Self::Uint(v) => write!(f, "{v}"),
            Self::List(items) => f.write_str(&items.join("; ")),
            Self::UintMap(map) => {
                let rendered: Vec<String> =
                    map.iter().map(|(k, v)| format!("{k}: {v}")).collect();
                f.write_str(&rendered.join("; "))
            }
        }
    }
}

/// Parses an unsigned value with optional binary size suffix (K/M/G/T).
///
/// # Errors
///
/// Returns `invalid-value` for malformed input or overflow.
pub fn parse_size(text: &str) -> Result<u64> {
    let text = text.trim();
    if text.is_empty() {
        return Err(WardenError::InvalidValue("empty number".into()));
    }
    let (digits, multiplier) = match text.as_bytes()[text.len() - 1].to_ascii_uppercase() {
        b'K' => (&text[..text.len() - 1], 1u64 << 10),
        b'M' => (&text[..text.len() - 1], 1 << 20),
        b'G' => (&text[..text.len() - 1], 1 << 30),
        b'T' => (&text[..text.len() - 1], 1 << 40),
        _ => (text, 1),
    };
    let base = digits.trim().parse::<u64>().map_err(|_| {
        WardenError::InvalidValue(format!("expected unsigned number, got {text:?}"))
    })?;
    base.checked_mul(multiplier)
        .ok_or_else(|| WardenError::InvalidValue(format!("value {text:?} overflows")))
}

/// Declaration of one property.
#[derive(Debug)]
pub struct PropertyDef {
    /// Canonical name.
    pub name: &'static str,
    /// Value type.
    pub kind: ValueKind,
    /// Flag bits from [`flags`].
    pub flags: u32,
    /// Container states in which a client may set the property.
    pub settable_in: &'static [ContainerState],
    /// Default value factory.
    pub default: fn() -> Value,
}

impl PropertyDef {
    /// True when the given flag bit is set.
    #[must_use]
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    /// True when a client may set the property in `state`.
    #[must_use]
    pub fn settable_in(&self, state: ContainerState) -> bool {
        self.settable_in.contains(&state)
    }
}

use ContainerState::{Dead, Meta, Paused, Running, Stopped};

const STOPPED_ONLY: &[ContainerState] = &[Stopped];
const DYNAMIC_STATES: &[ContainerState] = &[Stopped, Running, Meta, Dead];
const ANY_STATE: &[ContainerState] = &[Stopped, Running, Meta, Dead, Paused];

fn empty_str() -> Value {
    Value::Str(String::new())
}
fn root_path() -> Value {
    Value::Str("/".into())
}
fn user_root() -> Value {
    Value::Str("root".into())
}
fn app_mode() -> Value {
    Value::Str("app".into())
}
fn normal_policy() -> Value {
    Value::Str("normal".into())
}
fn bool_false() -> Value {
    Value::Bool(false)
}
fn bool_true() -> Value {
    Value::Bool(true)
}
fn uint_zero() -> Value {
    Value::Uint(0)
}
fn int_minus_one() -> Value {
    Value::Int(-1)
}
fn int_zero() -> Value {
    Value::Int(0)
}
fn empty_list() -> Value {
    Value::List(Vec::new())
}
fn empty_map() -> Value {
    Value::UintMap(BTreeMap::new())
}
fn day_seconds() -> Value {
    Value::Uint(60 * 60 * 24)
}

/// The full property schema.
#[must_use]
pub fn schema() -> &'static [PropertyDef] {
    use flags::{DYNAMIC, HIDDEN, OS_MODE, PARENT_RO, PERSISTENT, SUPERUSER};
    static SCHEMA: &[PropertyDef] = &[
        PropertyDef {
            name: names::COMMAND,
            kind: ValueKind::Str,
            flags: PERSISTENT | OS_MODE,
            settable_in: STOPPED_ONLY,
            default: empty_str,
        },
        PropertyDef {
            name: names::CWD,
            kind: ValueKind::Str,
            flags: PERSISTENT | PARENT_RO | OS_MODE,
            settable_in: STOPPED_ONLY,
            default: empty_str,
        },
        PropertyDef {
            name: names::ROOT,
            kind: ValueKind::Str,
            flags: PERSISTENT | PARENT_RO | OS_MODE,
            settable_in: STOPPED_ONLY,
            default: root_path,
        },
        PropertyDef {
            name: names::ROOT_READONLY,
            kind: ValueKind::Bool,
            flags: PERSISTENT | PARENT_RO,
            settable_in: STOPPED_ONLY,
            default: bool_false,
        },
        PropertyDef {
            name: names::USER,
            kind: ValueKind::Str,
            flags: PERSISTENT | SUPERUSER | OS_MODE,
            settable_in: STOPPED_ONLY,
            default: user_root,
        },
        PropertyDef {
            name: names::GROUP,
            kind: ValueKind::Str,
            flags: PERSISTENT | SUPERUSER | OS_MODE,
            settable_in: STOPPED_ONLY,
            default: user_root,
        },
        PropertyDef {
            name: names::ENV,
            kind: ValueKind::List,
            flags: PERSISTENT | OS_MODE,
            settable_in: STOPPED_ONLY,
            default: empty_list,
        },
        PropertyDef {
            name: names::ISOLATE,
            kind: ValueKind::Bool,
            flags: PERSISTENT,
            settable_in: STOPPED_ONLY,
            default: bool_true,
        },
        PropertyDef {
            name: names::STDOUT_PATH,
            kind: ValueKind::Str,
            flags: PERSISTENT,
            settable_in: STOPPED_ONLY,
            default: empty_str,
        },
        PropertyDef {
            name: names::STDERR_PATH,
            kind: ValueKind::Str,
            flags: PERSISTENT,
            settable_in: STOPPED_ONLY,
            default: empty_str,
        },
        PropertyDef {
            name: names::MEMORY_LIMIT,
            kind: ValueKind::Uint,
            flags: PERSISTENT | DYNAMIC,
            settable_in: DYNAMIC_STATES,
            default: uint_zero,
        },
        PropertyDef {
            name: names::MEMORY_GUARANTEE,
            kind: ValueKind::Uint,
            flags: PERSISTENT | DYNAMIC,
            settable_in: DYNAMIC_STATES,
            default: uint_zero,
        },
        PropertyDef {
            name: names::RECHARGE_ON_PGFAULT,
            kind: ValueKind::Bool,
            flags: PERSISTENT | DYNAMIC,
            settable_in: DYNAMIC_STATES,
            default: bool_false,
        },
        PropertyDef {
            name: names::CPU_POLICY,
            kind: ValueKind::Str,
            flags: PERSISTENT,
            settable_in: STOPPED_ONLY,
            default: normal_policy,
        },
        PropertyDef {
            name: names::CPU_LIMIT,
            kind: ValueKind::Uint,
            flags: PERSISTENT | DYNAMIC,
            settable_in: DYNAMIC_STATES,
            default: uint_zero,
        },
        PropertyDef {
            name: names::CPU_GUARANTEE,
            kind: ValueKind::Uint,
            flags: PERSISTENT | DYNAMIC,
            settable_in: DYNAMIC_STATES,
            default: uint_zero,
        },
        PropertyDef {
            name: names::IO_POLICY,
            kind: ValueKind::Str,
            flags: PERSISTENT | DYNAMIC,
            settable_in: DYNAMIC_STATES,
            default: normal_policy,
        },
        PropertyDef {
            name: names::IO_LIMIT,
            kind: ValueKind::Uint,
            flags: PERSISTENT | DYNAMIC,
            settable_in: DYNAMIC_STATES,
            default: uint_zero,
        },
        PropertyDef {
            name: names::NET_GUARANTEE,
            kind: ValueKind::UintMap,
            flags: PERSISTENT,
            settable_in: STOPPED_ONLY,
            default: empty_map,
        },
        PropertyDef {
            name: names::NET_LIMIT,
            kind: ValueKind::UintMap,
            flags: PERSISTENT,
            settable_in: STOPPED_ONLY,
            default: empty_map,
        },
        PropertyDef {
            name: names::NET_PRIORITY,
            kind: ValueKind::UintMap,
            flags: PERSISTENT,
            settable_in: STOPPED_ONLY,
            default: empty_map,
        },
        PropertyDef {
            name: names::RESPAWN,
            kind: ValueKind::Bool,
            flags: PERSISTENT | DYNAMIC,
            settable_in: DYNAMIC_STATES,
            default: bool_false,
        },
        PropertyDef {
            name: names::MAX_RESPAWNS,
            kind: ValueKind::Int,
            flags: PERSISTENT | DYNAMIC,
            settable_in: DYNAMIC_STATES,
            default: int_minus_one,
        },
        PropertyDef {
            name: names::AGING_TIME,
            kind: ValueKind::Uint,
            flags: PERSISTENT | DYNAMIC,
            settable_in: DYNAMIC_STATES,
            default: day_seconds,
        },
        PropertyDef {
            name: names::ALLOWED_DEVICES,
            kind: ValueKind::List,
            flags: PERSISTENT | SUPERUSER,
            settable_in: STOPPED_ONLY,
            default: empty_list,
        },
        PropertyDef {
            name: names::CAPABILITIES,
            kind: ValueKind::List,
            flags: PERSISTENT | SUPERUSER,
            settable_in: STOPPED_ONLY,
            default: empty_list,
        },
        PropertyDef {
            name: names::ULIMIT,
            kind: ValueKind::List,
            flags: PERSISTENT,
            settable_in: STOPPED_ONLY,
            default: empty_list,
        },
        PropertyDef {
            name: names::BIND,
            kind: ValueKind::List,
            flags: PERSISTENT | PARENT_RO,
            settable_in: STOPPED_ONLY,
            default: empty_list,
        },
        PropertyDef {
            name: names::HOSTNAME,
            kind: ValueKind::Str,
            flags: PERSISTENT | PARENT_RO,
            settable_in: STOPPED_ONLY,
            default: empty_str,
        },
        PropertyDef {
            name: names::VIRT_MODE,
            kind: ValueKind::Str,
            flags: PERSISTENT,
            settable_in: STOPPED_ONLY,
            default: app_mode,
        },
        PropertyDef {
            name: names::WARDEN_NAMESPACE,
            kind: ValueKind::Str,
            flags: PERSISTENT | PARENT_RO,
            settable_in: STOPPED_ONLY,
            default: empty_str,
        },
        PropertyDef {
            name: names::ENABLE_WARDEN,
            kind: ValueKind::Bool,
            flags: PERSISTENT,
            settable_in: STOPPED_ONLY,
            default: bool_true,
        },
        PropertyDef {
            name: names::RAW_NAME,
            kind: ValueKind::Str,
            flags: PERSISTENT | HIDDEN,
            settable_in: ANY_STATE,
            default: empty_str,
        },
        PropertyDef {
            name: names::RAW_ID,
            kind: ValueKind::Uint,
            flags: PERSISTENT | HIDDEN,
            settable_in: ANY_STATE,
            default: uint_zero,
        },
        PropertyDef {
            name: names::RAW_ROOT_PID,
            kind: ValueKind::Int,
            flags: PERSISTENT | HIDDEN,
            settable_in: ANY_STATE,
            default: int_zero,
        },
        PropertyDef {
            name: names::RAW_LOOP_DEV,
            kind: ValueKind::Int,
            flags: PERSISTENT | HIDDEN,
            settable_in: ANY_STATE,
            default: int_minus_one,
        },
    ];
    SCHEMA
}

/// Properties whose numeric values must respect the hierarchy invariant
/// (children sum ≤ own value ≤ ancestor caps).
pub const HIERARCHICAL: &[&str] = &[names::MEMORY_LIMIT, names::MEMORY_GUARANTEE];

/// Looks up a property definition.
///
/// # Errors
///
/// Returns `invalid-property` for an unknown name.
pub fn find(name: &str) -> Result<&'static PropertyDef> {
    schema()
        .iter()
        .find(|def| def.name == name)
        .ok_or_else(|| WardenError::InvalidProperty(name.to_string()))
}

/// Splits `name[index]` syntax into name and optional index.
///
/// # Errors
///
/// Returns `invalid-value` for unbalanced brackets.
pub fn split_index(raw: &str) -> Result<(&str, Option<&str>)> {
    match raw.find('[') {
        None => Ok((raw, None)),
        Some(open) => {
            let rest = &raw[open + 1..];
            let close = rest.rfind(']').ok_or_else(|| {
                WardenError::InvalidValue(format!("unbalanced index in {raw:?}"))
            })?;
            Ok((&raw[..open], Some(rest[..close].trim())))
        }
    }
}

/// Translates a legacy client-facing alias to (canonical name, value).
///
/// Returns the inputs unchanged when the name is not an alias.
#[must_use]
pub fn resolve_alias<'a>(name: &'a str, value: &'a str) -> (&'a str, std::borrow::Cow<'a, str>) {
    use std::borrow::Cow;
    match name {
        "cpu.smart" => {
            let policy = if value.trim() == "0" { "normal" } else { "rt" };
            (names::CPU_POLICY, Cow::Borrowed(policy))
        }
        "memory.limit_in_bytes" => (names::MEMORY_LIMIT, Cow::Borrowed(value)),
        "memory.low_limit_in_bytes" => (names::MEMORY_GUARANTEE, Cow::Borrowed(value)),
        "memory.recharge_on_pgfault" => {
            let flag = if value.trim() == "0" { "false" } else { "true" };
            (names::RECHARGE_ON_PGFAULT, Cow::Borrowed(flag))
        }
        _ => (name, Cow::Borrowed(value)),
    }
}

/// Renders a canonical value back through a legacy alias for `get`.
#[must_use]
pub fn alias_display(alias: &str, canonical_value: &str) -> String {
    match alias {
        "cpu.smart" => {
            if canonical_value == "rt" { "1" } else { "0" }.to_string()
        }
        "memory.recharge_on_pgfault" => {
            if canonical_value == "true" { "1" } else { "0" }.to_string()
        }
        _ => canonical_value.to_string(),
    }
}

/// True when the client name is a known alias.
#[must_use]
pub fn is_alias(name: &str) -> bool {
    matches!(
        name,
        "cpu.smart"
            | "memory.limit_in_bytes"
            | "memory.low_limit_in_bytes"
            | "memory.recharge_on_pgfault"
    )
}

/// Per-property semantic validation beyond kind parsing.
///
/// # Errors
///
/// Returns `invalid-value` describing what is wrong.
pub fn validate(name: &str, value: &Value) -> Result<()> {
    match name {
        names::CPU_POLICY => {
            let policy = value.as_str().unwrap_or_default();
            if !["normal", "rt", "batch"].contains(&policy) {
                return Err(WardenError::InvalidValue(format!(
                    "unknown cpu policy {policy:?}"
                )));
            }
        }
        names::IO_POLICY => {
            let policy = value.as_str().unwrap_or_default();
            if !["normal", "batch"].contains(&policy) {
                return Err(WardenError::InvalidValue(format!(
                    "unknown io policy {policy:?}"
                )));
            }
        }
        names::VIRT_MODE => {
            let mode = value.as_str().unwrap_or_default();
            if !["app", "os"].contains(&mode) {
                return Err(WardenError::InvalidValue(format!(
                    "unknown virt mode {mode:?}"
                )));
            }
        }
        names::CPU_LIMIT | names::CPU_GUARANTEE => {
            let percent = value.as_uint().unwrap_or_default();
            if percent > 100 * 256 {
                return Err(WardenError::InvalidValue(
                    "cpu percentage out of range".into(),
                ));
            }
        }
        names::ENV => {
            if let Value::List(items) = value {
                for item in items {
                    if !item.contains('=') {
                        return Err(WardenError::InvalidValue(format!(
                            "environment entry {item:?} is not KEY=value"
                        )));
                    }
                }
            }
        }
        names::ULIMIT => {
            if let Value::List(items) = value {
                for item in items {
                    let mut parts = item.split_whitespace();
                    let name_ok = parts.next().is_some();
                    let soft_ok = parts
                        .next()
                        .is_some_and(|v| v == "unlimited" || v.parse::<u64>().is_ok());
                    let hard_ok = parts
                        .next()
                        .is_some_and(|v| v == "unlimited" || v.parse::<u64>().is_ok());
                    if !(name_ok && soft_ok && hard_ok && parts.next().is_none()) {
                        return Err(WardenError::InvalidValue(format!(
                            "ulimit entry {item:?} is not <name> <soft> <hard>"
                        )));
                    }
                }
            }
        }
        names::BIND => {
            if let Value::List(items) = value {
                for item in items {
                    let words: Vec<&str> = item.split_whitespace().collect();
                    if !(words.len() == 2 || (words.len() == 3 && words[2] == "ro")) {
                        return Err(WardenError::InvalidValue(format!(
                            "bind entry {item:?} is not <source> <target> [ro]"
                        )));
                    }
                }
            }
        }
        _ => {}
    }
    Ok(())
}

/// Name-keyed value store backed by the schema.
#[derive(Debug, Default)]
pub struct PropertyMap {
    values: BTreeMap<&'static str, Value>,
}

impl PropertyMap {
    /// An empty map; every read falls back to the schema default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Typed value of a property, default when unset.
    ///
    /// # Errors
    ///
    /// Returns `invalid-property` for an unknown name.
    pub fn get(&self, name: &str) -> Result<Value> {
        let def = find(name)?;
        Ok(self
            .values
            .get(def.name)
            .cloned()
            .unwrap_or_else(|| (def.default)()))
    }

    /// Shorthand for unsigned reads.
    #[must_use]
    pub fn get_uint(&self, name: &str) -> u64 {
        self.get(name).ok().and_then(|v| v.as_uint()).unwrap_or(0)
    }

    /// Shorthand for boolean reads.
    #[must_use]
    pub fn get_bool(&self, name: &str) -> bool {
        self.get(name).ok().and_then(|v| v.as_bool()).unwrap_or(false)
    }

    /// Shorthand for string reads.
    #[must_use]
    pub fn get_string(&self, name: &str) -> String {
        self.get(name).map(|v| v.to_string()).unwrap_or_default()
    }

    /// True when the property still has its default value.
    #[must_use]
    pub fn is_default(&self, name: &str) -> bool {
        !self.values.contains_key(name)
    }

    /// Stores a typed value, writing through to the kv node when the
    /// property is persistent.
    ///
    /// The kv write happens before the in-memory commit so a storage
    /// failure leaves both views unchanged.
    ///
    /// # Errors
    ///
    /// Returns `invalid-property`, a kind mismatch as `invalid-value`,
    /// or the kv write error.
    pub fn set_value(&mut self, name: &str, value: Value, node: Option<&KvNode>) -> Result<()> {
        let def = find(name)?;
        if value.kind() != def.kind {
            return Err(WardenError::InvalidValue(format!(
                "wrong type for property {name}"
            )));
        }
        validate(def.name, &value)?;
        if def.has_flag(flags::PERSISTENT) {
            if let Some(node) = node {
                node.set(def.name, &value.to_string())?;
            }
        }
        self.values.insert(def.name, value);
        Ok(())
    }

    /// Parses and stores the client string form of a property.
    ///
    /// # Errors
    ///
    /// As [`PropertyMap::set_value`], plus parse failures.
    pub fn set_from_string(
        &mut self,
        name: &str,
        text: &str,
        node: Option<&KvNode>,
    ) -> Result<()> {
        let def = find(name)?;
        let value = Value::parse(def.kind, text)?;
        self.set_value(name, value, node)
    }

    /// Updates one key of a map-valued property.
    ///
    /// # Errors
    ///
    /// Returns `invalid-value` when the property is not map-valued or the
    /// value does not parse.
    pub fn set_indexed(
        &mut self,
        name: &str,
        index: &str,
        text: &str,
        node: Option<&KvNode>,
    ) -> Result<()> {
        let Value::UintMap(mut map) = self.get(name)? else {
            return Err(WardenError::InvalidValue(format!(
                "property {name} does not take an index"
            )));
        };
        map.insert(index.to_string(), parse_size(text)?);
        self.set_value(name, Value::UintMap(map), node)
    }

    /// Reverts a property to its default, removing the persisted value.
    ///
    /// # Errors
    ///
    /// Returns `invalid-property` or the kv unlink error.
    pub fn reset(&mut self, name: &str, node: Option<&KvNode>) -> Result<()> {
        let def = find(name)?;
        if def.has_flag(flags::PERSISTENT) {
            if let Some(node) = node {
                node.remove_key(def.name)?;
            }
        }
        self.values.remove(def.name);
        Ok(())
    }

    /// Loads persisted values, ignoring keys the schema no longer knows
    /// (the flush half of restore) and values that fail to parse.
    pub fn restore(&mut self, pairs: &BTreeMap<String, String>) {
        for (key, text) in pairs {
            let Ok(def) = find(key) else {
                tracing::debug!(key, "dropping unknown persisted property");
                continue;
            };
            match Value::parse(def.kind, text) {
                Ok(value) => {
                    self.values.insert(def.name, value);
                }
                Err(e) => {
                    tracing::warn!(key, error = %e, "dropping unparsable persisted property");
                }
            }
        }
    }

    /// Rewrites every persistent value to the node, completing a restore.
    ///
    /// # Errors
    ///
    /// Returns the first kv write error.
    pub fn sync(&self, node: &KvNode) -> Result<()> {
        for (name, value) in &self.values {
            let def = find(name)?;
            if def.has_flag(flags::PERSISTENT) {
                node.set(name, &value.to_string())?;
            }
        }
        Ok(())
    }

    /// Client-visible property names.
    #[must_use]
    pub fn list() -> Vec<&'static str> {
        schema()
            .iter()
            .filter(|def| !def.has_flag(flags::HIDDEN))
            .map(|def| def.name)
            .collect()
    }

    /// Names of explicitly set, non-default properties.
    #[must_use]
    pub fn set_names(&self) -> Vec<&'static str> {
        self.values.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_parse_with_suffixes() {
        assert_eq!(parse_size("2M").unwrap(), 2 << 20);
        assert_eq!(parse_size("1g").unwrap(), 1 << 30);
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("3K").unwrap(), 3 << 10);
        assert!(parse_size("").is_err());
        assert!(parse_size("MM").is_err());
        assert!(parse_size("99999999999999999T").is_err());
    }

    #[test]
    fn bool_accepts_numeric_forms() {
        assert_eq!(Value::parse(ValueKind::Bool, "1").unwrap(), Value::Bool(true));
        assert_eq!(Value::parse(ValueKind::Bool, "false").unwrap(), Value::Bool(false));
        assert!(Value::parse(ValueKind::Bool, "yes").is_err());
    }

    #[test]
    fn uint_map_parses_and_displays_canonically() {
        let value = Value::parse(ValueKind::UintMap, "eth0: 1000; eth1: 2M").unwrap();
        let Value::UintMap(map) = &value else { panic!() };
        assert_eq!(map["eth0"], 1000);
        assert_eq!(map["eth1"], 2 << 20);
        assert_eq!(value.to_string(), "eth0: 1000; eth1: 2097152");
    }

    #[test]
    fn list_splits_on_semicolons() {
        let value = Value::parse(ValueKind::List, "A=1; B=2 ;").unwrap();
        assert_eq!(
            value,
            Value::List(vec!["A=1".to_string(), "B=2".to_string()])
        );
    }

    #[test]
    fn defaults_answer_without_storage() {
        let map = PropertyMap::new();
        assert_eq!(map.get_string(names::ROOT), "/");
        assert_eq!(map.get_uint(names::MEMORY_LIMIT), 0);
        assert!(map.get_bool(names::ISOLATE));
        assert!(map.is_default(names::COMMAND));
    }

    #[test]
    fn unknown_property_is_invalid_property() {
        let map = PropertyMap::new();
        assert_eq!(map.get("no_such").unwrap_err().kind(), "invalid-property");
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let mut map = PropertyMap::new();
        let err = map
            .set_value(names::MEMORY_LIMIT, Value::Str("a lot".into()), None)
            .unwrap_err();
        assert_eq!(err.kind(), "invalid-value");
    }

    #[test]
    fn policy_validators_reject_unknown_names() {
        let mut map = PropertyMap::new();
        assert!(map.set_from_string(names::CPU_POLICY, "rt", None).is_ok());
        assert!(map.set_from_string(names::CPU_POLICY, "fifo", None).is_err());
        assert!(map.set_from_string(names::IO_POLICY, "batch", None).is_ok());
        assert!(map.set_from_string(names::IO_POLICY, "slow", None).is_err());
        assert!(map.set_from_string(names::VIRT_MODE, "os", None).is_ok());
        assert!(map.set_from_string(names::VIRT_MODE, "vm", None).is_err());
    }

    #[test]
    fn env_entries_must_be_assignments() {
        let mut map = PropertyMap::new();
        assert!(map.set_from_string(names::ENV, "A=1; B=2", None).is_ok());
        assert!(map.set_from_string(names::ENV, "A=1; JUNK", None).is_err());
    }

    #[test]
    fn bind_entries_are_validated() {
        let mut map = PropertyMap::new();
        assert!(map.set_from_string(names::BIND, "/src /dst", None).is_ok());
        assert!(map.set_from_string(names::BIND, "/src /dst ro", None).is_ok());
        assert!(map.set_from_string(names::BIND, "/src", None).is_err());
        assert!(map.set_from_string(names::BIND, "/a /b rw", None).is_err());
    }

    #[test]
    fn ulimit_entries_are_validated() {
        let mut map = PropertyMap::new();
        assert!(map
            .set_from_string(names::ULIMIT, "nofile 1024 4096; core 0 unlimited", None)
            .is_ok());
        assert!(map.set_from_string(names::ULIMIT, "nofile many", None).is_err());
    }

    #[test]
    fn indexed_set_updates_one_key() {
        let mut map = PropertyMap::new();
        map.set_from_string(names::NET_GUARANTEE, "eth0: 100", None)
            .unwrap();
        map.set_indexed(names::NET_GUARANTEE, "eth1", "2K", None)
            .unwrap();
        let Value::UintMap(m) = map.get(names::NET_GUARANTEE).unwrap() else {
            panic!()
        };
        assert_eq!(m["eth0"], 100);
        assert_eq!(m["eth1"], 2048);

        assert!(map.set_indexed(names::MEMORY_LIMIT, "x", "1", None).is_err());
    }

    #[test]
    fn index_syntax_splits() {
        assert_eq!(split_index("net_guarantee[eth0]").unwrap(), ("net_guarantee", Some("eth0")));
        assert_eq!(split_index("memory_limit").unwrap(), ("memory_limit", None));
        assert!(split_index("net_guarantee[eth0").is_err());
    }

    #[test]
    fn aliases_translate_both_ways() {
        assert_eq!(resolve_alias("cpu.smart", "1").0, names::CPU_POLICY);
        assert_eq!(resolve_alias("cpu.smart", "1").1, "rt");
        assert_eq!(resolve_alias("cpu.smart", "0").1, "normal");
        assert_eq!(
            resolve_alias("memory.limit_in_bytes", "2M").0,
            names::MEMORY_LIMIT
        );
        assert_eq!(
            resolve_alias("memory.recharge_on_pgfault", "1").1,
            "true"
        );
        assert_eq!(alias_display("cpu.smart", "rt"), "1");
        assert_eq!(alias_display("cpu.smart", "normal"), "0");
        assert_eq!(alias_display("memory.recharge_on_pgfault", "false"), "0");
        assert_eq!(resolve_alias("command", "true").0, "command");
    }

    #[test]
    fn persistence_roundtrip_through_kv() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = crate::kv::KvStore::open(dir.path()).unwrap();
        let node = store.node(warden_common::types::ContainerId(7));

        let mut map = PropertyMap::new();
        map.set_from_string(names::MEMORY_LIMIT, "2M", Some(&node))
            .unwrap();
        map.set_from_string(names::COMMAND, "sleep 1000", Some(&node))
            .unwrap();

        let mut restored = PropertyMap::new();
        restored.restore(&node.read_all().unwrap());
        assert_eq!(restored.get_uint(names::MEMORY_LIMIT), 2 << 20);
        assert_eq!(restored.get_string(names::COMMAND), "sleep 1000");
    }

    #[test]
    fn restore_drops_unknown_keys() {
        let mut map = PropertyMap::new();
        let pairs = BTreeMap::from([
            ("command".to_string(), "true".to_string()),
            ("decommissioned_knob".to_string(), "42".to_string()),
        ]);
        map.restore(&pairs);
        assert_eq!(map.get_string(names::COMMAND), "true");
        assert_eq!(map.set_names(), vec![names::COMMAND]);
    }

    #[test]
    fn reset_removes_value_and_persisted_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = crate::kv::KvStore::open(dir.path()).unwrap();
        let node = store.node(warden_common::types::ContainerId(8));

        let mut map = PropertyMap::new();
        map.set_from_string(names::MEMORY_LIMIT, "1M", Some(&node))
            .unwrap();
        map.reset(names::MEMORY_LIMIT, Some(&node)).unwrap();
        assert!(map.is_default(names::MEMORY_LIMIT));
        assert_eq!(node.get(names::MEMORY_LIMIT).unwrap(), None);
    }

    #[test]
    fn hidden_properties_are_not_listed() {
        let listed = PropertyMap::list();
        assert!(listed.contains(&names::COMMAND));
        assert!(!listed.contains(&names::RAW_ID));
    }
}
