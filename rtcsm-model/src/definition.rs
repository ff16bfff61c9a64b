//! JSON machine definitions.
//!
//! Definitions describe a model whose context is a JSON value. Guards use
//! the [`GuardExpr`] language and actions are a small set of context
//! updates:
//!
//! ```json
//! {
//!   "regions": [{
//!     "key": "main",
//!     "vertices": [
//!       {"key": "init", "kind": "initial"},
//!       {"key": "idle", "defer": ["flush"]},
//!       {"key": "busy", "entry": [{"action": "increment", "path": "jobs"}]},
//!       {"key": "done", "kind": "final"}
//!     ]
//!   }],
//!   "transitions": [
//!     {"from": "init", "to": "idle"},
//!     {"from": "idle", "to": "busy", "on": "start", "guard": "event.size > 0",
//!      "effect": [{"action": "merge_payload"}]},
//!     {"from": "busy", "to": "idle", "after_ms": 500},
//!     {"from": ["idle", "busy"], "to": "done", "on": "stop"}
//!   ]
//! }
//! ```
//!
//! Vertices may nest `regions`, declare `connection_points`, or reference a
//! named entry of `submachines`, which is inlined with keys prefixed by the
//! referencing state's key.

use crate::behavior::{ActionFn, BehaviorError, Delay, Event, Guard, GuardFn};
use crate::builder::{ModelBuilder, TransitionSpec};
use crate::error::ModelError;
use crate::guard::GuardExpr;
use crate::ids::{RegionId, VertexId};
use crate::machine::StateMachine;
use crate::transition::TransitionKind;
use crate::vertex::PseudoKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Vertex kinds accepted in definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VertexKindRaw {
    #[default]
    State,
    Final,
    Initial,
    Choice,
    Junction,
    Fork,
    Join,
    ShallowHistory,
    DeepHistory,
    EntryPoint,
    ExitPoint,
    Terminate,
}

impl VertexKindRaw {
    fn pseudo(self) -> Option<PseudoKind> {
        Some(match self {
            VertexKindRaw::State | VertexKindRaw::Final => return None,
            VertexKindRaw::Initial => PseudoKind::Initial,
            VertexKindRaw::Choice => PseudoKind::Choice,
            VertexKindRaw::Junction => PseudoKind::Junction,
            VertexKindRaw::Fork => PseudoKind::Fork,
            VertexKindRaw::Join => PseudoKind::Join,
            VertexKindRaw::ShallowHistory => PseudoKind::ShallowHistory,
            VertexKindRaw::DeepHistory => PseudoKind::DeepHistory,
            VertexKindRaw::EntryPoint => PseudoKind::EntryPoint,
            VertexKindRaw::ExitPoint => PseudoKind::ExitPoint,
            VertexKindRaw::Terminate => PseudoKind::Terminate,
        })
    }
}

/// Context update run as an effect, entry or exit action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionRaw {
    /// Writes a literal at a dotted context path.
    Set { path: String, value: Value },
    /// Merges the event payload object into the context object.
    MergePayload,
    /// Adds `by` (default 1) to the number at a dotted context path.
    Increment {
        path: String,
        #[serde(default = "default_increment")]
        by: i64,
    },
}

fn default_increment() -> i64 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionPointRaw {
    pub key: String,
    pub kind: VertexKindRaw,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VertexRaw {
    pub key: String,
    #[serde(default)]
    pub kind: VertexKindRaw,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub regions: Vec<RegionRaw>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connection_points: Vec<ConnectionPointRaw>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submachine: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entry: Vec<ActionRaw>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exit: Vec<ActionRaw>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub defer: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionRaw {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub vertices: Vec<VertexRaw>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRaw {
    /// Source vertex key(s). Can be a single key or a list.
    #[serde(deserialize_with = "one_or_many")]
    pub from: Vec<String>,

    pub to: String,

    /// Trigger(s). Omitted for completion and timed transitions.
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub on: Vec<String>,

    /// Guard expression, or `"else"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,

    #[serde(default)]
    pub kind: TransitionKind,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub effect: Vec<ActionRaw>,

    /// Fixed timer delay in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_ms: Option<u64>,

    /// Context path holding the timer delay in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_ctx: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{self, Visitor};
    use std::fmt;

    struct OneOrMany;

    impl<'de> Visitor<'de> for OneOrMany {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or array of strings")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(vec![v.to_string()])
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut items = Vec::new();
            while let Some(s) = seq.next_element::<String>()? {
                items.push(s);
            }
            Ok(items)
        }
    }

    deserializer.deserialize_any(OneOrMany)
}

/// Body of a named submachine template.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmachineRaw {
    #[serde(default)]
    pub regions: Vec<RegionRaw>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connection_points: Vec<ConnectionPointRaw>,
    #[serde(default)]
    pub transitions: Vec<TransitionRaw>,
}

/// Raw machine definition as stored/transmitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineDefinitionRaw {
    pub regions: Vec<RegionRaw>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connection_points: Vec<ConnectionPointRaw>,

    #[serde(default)]
    pub transitions: Vec<TransitionRaw>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub submachines: BTreeMap<String, SubmachineRaw>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// A loaded definition and the model built from it.
#[derive(Debug, Clone)]
pub struct MachineDefinition {
    pub name: String,
    pub version: u32,
    pub raw: MachineDefinitionRaw,
    /// CRC32C of the serialized raw definition.
    pub checksum: String,
    machine: Arc<StateMachine<Value>>,
}

impl MachineDefinition {
    /// Parses a definition and builds its model.
    pub fn from_json(
        name: impl Into<String>,
        version: u32,
        json: &Value,
    ) -> Result<Self, ModelError> {
        let raw: MachineDefinitionRaw = serde_json::from_value(json.clone())?;
        Self::from_raw(name, version, raw)
    }

    /// Parses a definition from JSON text.
    pub fn from_json_str(
        name: impl Into<String>,
        version: u32,
        text: &str,
    ) -> Result<Self, ModelError> {
        let raw: MachineDefinitionRaw = serde_json::from_str(text)?;
        Self::from_raw(name, version, raw)
    }

    pub fn from_raw(
        name: impl Into<String>,
        version: u32,
        raw: MachineDefinitionRaw,
    ) -> Result<Self, ModelError> {
        let name = name.into();
        let body = SubmachineRaw {
            regions: raw.regions.clone(),
            connection_points: raw.connection_points.clone(),
            transitions: raw.transitions.clone(),
        };

        let mut builder = ModelBuilder::new(name.clone());
        let mut stack = Vec::new();
        populate(&mut builder, &body, &raw.submachines, &mut stack)?;
        let machine = builder.build()?;

        let json_bytes = serde_json::to_vec(&raw)?;
        let checksum = format!("{:08x}", crc32c::crc32c(&json_bytes));

        tracing::debug!(
            "Loaded definition {} v{} (checksum {})",
            name,
            version,
            checksum
        );

        Ok(Self {
            name,
            version,
            raw,
            checksum,
            machine: Arc::new(machine),
        })
    }

    /// Returns the shared model.
    pub fn machine(&self) -> Arc<StateMachine<Value>> {
        Arc::clone(&self.machine)
    }

    /// Returns the raw definition as JSON.
    pub fn to_json(&self) -> Result<Value, ModelError> {
        Ok(serde_json::to_value(&self.raw)?)
    }
}

fn populate(
    builder: &mut ModelBuilder<Value>,
    body: &SubmachineRaw,
    templates: &BTreeMap<String, SubmachineRaw>,
    stack: &mut Vec<String>,
) -> Result<(), ModelError> {
    for cp in &body.connection_points {
        let kind = connection_kind(cp)?;
        let id = builder.add_machine_connection_point(cp.key.clone(), kind)?;
        if let Some(name) = &cp.name {
            builder.set_name(id, name.clone())?;
        }
    }
    for region in &body.regions {
        let id = builder.add_region(region.key.clone())?;
        if let Some(name) = &region.name {
            builder.set_region_name(id, name.clone())?;
        }
        add_vertices(builder, id, region, templates, stack)?;
    }
    for t in &body.transitions {
        add_transitions(builder, t)?;
    }
    Ok(())
}

fn add_vertices(
    builder: &mut ModelBuilder<Value>,
    region: RegionId,
    raw: &RegionRaw,
    templates: &BTreeMap<String, SubmachineRaw>,
    stack: &mut Vec<String>,
) -> Result<(), ModelError> {
    for v in &raw.vertices {
        let id = match (v.kind, v.kind.pseudo()) {
            (VertexKindRaw::Final, _) => builder.add_final(region, v.key.clone())?,
            (_, Some(kind)) => builder.add_pseudostate(region, v.key.clone(), kind)?,
            (_, None) => match &v.submachine {
                Some(template) => {
                    if !v.regions.is_empty() {
                        return Err(ModelError::InvalidDefinition {
                            reason: format!(
                                "state '{}' references a submachine and declares regions",
                                v.key
                            ),
                        });
                    }
                    let inner = build_template(template, templates, stack)?;
                    builder.add_submachine_state(region, v.key.clone(), &inner)?
                }
                None => builder.add_state(region, v.key.clone())?,
            },
        };

        if let Some(name) = &v.name {
            builder.set_name(id, name.clone())?;
        }
        for action in &v.entry {
            builder.on_entry_fn(id, action_fn(action.clone()))?;
        }
        for action in &v.exit {
            builder.on_exit_fn(id, action_fn(action.clone()))?;
        }
        for trigger in &v.defer {
            builder.defer(id, trigger.clone())?;
        }
        for cp in &v.connection_points {
            let kind = connection_kind(cp)?;
            let cp_id = builder.add_connection_point(id, cp.key.clone(), kind)?;
            if let Some(name) = &cp.name {
                builder.set_name(cp_id, name.clone())?;
            }
        }
        for sub in &v.regions {
            let sub_id = builder.add_state_region(id, sub.key.clone())?;
            if let Some(name) = &sub.name {
                builder.set_region_name(sub_id, name.clone())?;
            }
            add_vertices(builder, sub_id, sub, templates, stack)?;
        }
    }
    Ok(())
}

fn build_template(
    name: &str,
    templates: &BTreeMap<String, SubmachineRaw>,
    stack: &mut Vec<String>,
) -> Result<ModelBuilder<Value>, ModelError> {
    if stack.iter().any(|s| s == name) {
        return Err(ModelError::InvalidDefinition {
            reason: format!("submachine '{}' references itself", name),
        });
    }
    let body = templates
        .get(name)
        .ok_or_else(|| ModelError::UnknownSubmachine {
            name: name.to_string(),
        })?;

    stack.push(name.to_string());
    let mut builder = ModelBuilder::new(name);
    let result = populate(&mut builder, body, templates, stack);
    stack.pop();
    result.map(|_| builder)
}

fn connection_kind(cp: &ConnectionPointRaw) -> Result<PseudoKind, ModelError> {
    match cp.kind.pseudo() {
        Some(kind) if kind.is_connection_point() => Ok(kind),
        _ => Err(ModelError::InvalidDefinition {
            reason: format!("connection point '{}' must be an entry or exit point", cp.key),
        }),
    }
}

fn add_transitions(builder: &mut ModelBuilder<Value>, raw: &TransitionRaw) -> Result<(), ModelError> {
    let target = lookup(builder, &raw.to)?;
    let guard = match raw.guard.as_deref() {
        None => None,
        Some("else") => Some(Guard::Else),
        Some(expr) => Some(Guard::When(guard_fn(GuardExpr::parse(expr)?))),
    };
    let effect = if raw.effect.is_empty() {
        None
    } else {
        Some(actions_fn(raw.effect.clone()))
    };
    let timer = match (raw.after_ms, &raw.after_ctx) {
        (Some(_), Some(_)) => {
            return Err(ModelError::InvalidDefinition {
                reason: "transition declares both after_ms and after_ctx".to_string(),
            })
        }
        (Some(ms), None) => Some(Delay::Fixed(Duration::from_millis(ms))),
        (None, Some(path)) => Some(ctx_delay(path.clone())),
        (None, None) => None,
    };

    for from in &raw.from {
        let source = lookup(builder, from)?;
        let mut spec = TransitionSpec::new(source, target).kind(raw.kind);
        for trigger in &raw.on {
            spec = spec.on(trigger.clone());
        }
        match &guard {
            Some(Guard::When(f)) => spec = spec.guard_fn(Arc::clone(f)),
            Some(Guard::Else) => spec = spec.else_guard(),
            None => {}
        }
        if let Some(effect) = &effect {
            spec = spec.effect_fn(Arc::clone(effect));
        }
        if let Some(timer) = &timer {
            spec = spec.delay(timer.clone());
        }
        if let Some(name) = &raw.name {
            spec = spec.named(name.clone());
        }
        builder.add_transition(spec)?;
    }
    Ok(())
}

fn lookup(builder: &ModelBuilder<Value>, key: &str) -> Result<VertexId, ModelError> {
    builder.find_vertex(key).ok_or_else(|| ModelError::UnknownVertex {
        key: key.to_string(),
    })
}

fn guard_fn(expr: GuardExpr) -> GuardFn<Value> {
    Arc::new(move |ctx: &Value, event: &Event| Ok(expr.evaluate(ctx, &event.payload)))
}

fn ctx_delay(path: String) -> Delay<Value> {
    let path = path.trim_start_matches("ctx.").to_string();
    Delay::Computed(Arc::new(move |ctx: &Value| {
        let ms = lookup_path(ctx, &path).and_then(Value::as_u64).unwrap_or(0);
        Duration::from_millis(ms)
    }))
}

fn action_fn(action: ActionRaw) -> ActionFn<Value> {
    actions_fn(vec![action])
}

fn actions_fn(actions: Vec<ActionRaw>) -> ActionFn<Value> {
    Arc::new(move |ctx: &mut Value, event: &Event| {
        for action in &actions {
            apply_action(action, ctx, event)?;
        }
        Ok(())
    })
}

/// Applies one action to a JSON context.
pub fn apply_action(action: &ActionRaw, ctx: &mut Value, event: &Event) -> Result<(), BehaviorError> {
    match action {
        ActionRaw::Set { path, value } => {
            *path_mut(ctx, path)? = value.clone();
        }
        ActionRaw::MergePayload => merge_payload(ctx, &event.payload),
        ActionRaw::Increment { path, by } => {
            let slot = path_mut(ctx, path)?;
            let next = match &*slot {
                Value::Null => Value::from(*by),
                Value::Number(n) => match n.as_i64() {
                    Some(i) => Value::from(i.saturating_add(*by)),
                    None => Value::from(n.as_f64().unwrap_or(0.0) + *by as f64),
                },
                other => {
                    return Err(BehaviorError::new(format!(
                        "cannot increment '{}': not a number ({})",
                        path, other
                    )))
                }
            };
            *slot = next;
        }
    }
    Ok(())
}

/// Merges payload into context.
fn merge_payload(ctx: &mut Value, payload: &Value) {
    if let (Value::Object(ctx_map), Value::Object(payload_map)) = (ctx, payload) {
        for (k, v) in payload_map {
            ctx_map.insert(k.clone(), v.clone());
        }
    }
}

fn lookup_path<'a>(ctx: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(ctx, |current, part| current.get(part))
}

fn path_mut<'a>(ctx: &'a mut Value, path: &str) -> Result<&'a mut Value, BehaviorError> {
    let mut current = ctx;
    for part in path.split('.') {
        if current.is_null() {
            *current = Value::Object(Default::default());
        }
        current = match current {
            Value::Object(map) => map.entry(part.to_string()).or_insert(Value::Null),
            _ => {
                return Err(BehaviorError::new(format!(
                    "cannot write '{}': '{}' is not an object",
                    path, part
                )))
            }
        };
    }
    Ok(current)
}
