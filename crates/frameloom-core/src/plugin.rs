//! Plugin functions: signature grammar, validation and invocation.
//!
//! A signature is a semicolon-separated list of argument specs, each
//! spec colon-separated: `name:typeName[:modifier]*;`. A `[]` suffix on
//! the type marks an array; recognized modifiers are `opt` and `empty`
//! (array-only). Which type names are recognized depends on the API
//! generation the plugin registered under.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::Core;
use crate::props::{PropType, PropertyMap};

/// API generation a plugin or function was registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiGeneration {
    /// The previous generation: `clip`/`frame` type names, no audio.
    Legacy,
    /// The current generation: `vnode`/`anode`/`vframe`/`aframe`.
    Current,
}

/// Function names and argument names share the strict identifier rule.
pub fn is_valid_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// One parsed argument of a plugin function signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterArgument {
    pub name: String,
    pub prop_type: PropType,
    pub array: bool,
    pub empty: bool,
    pub optional: bool,
}

fn type_from_name(type_name: &str, api: ApiGeneration) -> Option<PropType> {
    match (type_name, api) {
        ("int", _) => Some(PropType::Int),
        ("float", _) => Some(PropType::Float),
        ("data", _) => Some(PropType::Data),
        ("func", _) => Some(PropType::Function),
        ("vnode", ApiGeneration::Current) | ("clip", ApiGeneration::Legacy) => {
            Some(PropType::VideoNode)
        }
        ("anode", ApiGeneration::Current) => Some(PropType::AudioNode),
        ("vframe", ApiGeneration::Current) | ("frame", ApiGeneration::Legacy) => {
            Some(PropType::VideoFrame)
        }
        ("aframe", ApiGeneration::Current) => Some(PropType::AudioFrame),
        _ => None,
    }
}

fn type_name(prop_type: PropType, api: ApiGeneration) -> Option<&'static str> {
    Some(match (prop_type, api) {
        (PropType::Int, _) => "int",
        (PropType::Float, _) => "float",
        (PropType::Data, _) => "data",
        (PropType::Function, _) => "func",
        (PropType::VideoNode, ApiGeneration::Current) => "vnode",
        (PropType::VideoNode, ApiGeneration::Legacy) => "clip",
        (PropType::VideoFrame, ApiGeneration::Current) => "vframe",
        (PropType::VideoFrame, ApiGeneration::Legacy) => "frame",
        (PropType::AudioNode, ApiGeneration::Current) => "anode",
        (PropType::AudioFrame, ApiGeneration::Current) => "aframe",
        (PropType::AudioNode | PropType::AudioFrame, ApiGeneration::Legacy) => return None,
    })
}

/// Parse a signature string into its argument list.
pub fn parse_signature(spec: &str, api: ApiGeneration) -> Result<Vec<FilterArgument>, String> {
    let mut args = Vec::new();

    for raw in spec.split(';').filter(|s| !s.is_empty()) {
        let parts: Vec<&str> = raw.split(':').filter(|s| !s.is_empty()).collect();
        if parts.len() < 2 {
            return Err(format!(
                "invalid argument specifier '{raw}'; it appears to be incomplete"
            ));
        }

        let name = parts[0];
        let mut type_part = parts[1];
        let mut array = false;
        if let Some(stripped) = type_part.strip_suffix("[]") {
            type_part = stripped;
            array = true;
        }

        let Some(prop_type) = type_from_name(type_part, api) else {
            return Err(format!("argument '{name}' has invalid type '{type_part}'"));
        };

        let mut optional = false;
        let mut empty = false;
        for modifier in &parts[2..] {
            match *modifier {
                "opt" => {
                    if optional {
                        return Err(format!(
                            "argument '{name}' has duplicate argument specifier '{modifier}'"
                        ));
                    }
                    optional = true;
                }
                "empty" => {
                    if empty {
                        return Err(format!(
                            "argument '{name}' has duplicate argument specifier '{modifier}'"
                        ));
                    }
                    empty = true;
                }
                _ => {
                    return Err(format!(
                        "argument '{name}' has unknown argument modifier '{modifier}'"
                    ));
                }
            }
        }

        if !is_valid_identifier(name) {
            return Err(format!("argument name '{name}' contains illegal characters"));
        }

        if empty && !array {
            return Err(format!(
                "argument '{name}' is not an array; only array arguments can have the empty flag set"
            ));
        }

        args.push(FilterArgument {
            name: name.to_string(),
            prop_type,
            array,
            empty,
            optional,
        });
    }

    Ok(args)
}

/// Re-emit a parsed argument list in canonical form for the given
/// generation. Returns `None` when an argument type has no name in that
/// generation (audio types cannot cross into the legacy API).
pub fn emit_signature(args: &[FilterArgument], api: ApiGeneration) -> Option<String> {
    let mut out = String::new();
    for arg in args {
        out.push_str(&arg.name);
        out.push(':');
        out.push_str(type_name(arg.prop_type, api)?);
        if arg.array {
            out.push_str("[]");
        }
        if arg.optional {
            out.push_str(":opt");
        }
        if arg.empty {
            out.push_str(":empty");
        }
        out.push(';');
    }
    Some(out)
}

/// The callable registered for a plugin function or wrapped into a
/// function reference.
pub type PublicFunction = Arc<dyn Fn(&PropertyMap, &mut PropertyMap, &Core) + Send + Sync>;

struct FuncInner {
    func: PublicFunction,
    api: ApiGeneration,
    core: Core,
}

impl Drop for FuncInner {
    fn drop(&mut self) {
        self.core.function_instance_destroyed();
    }
}

/// A reference-counted callable value held by property maps.
#[derive(Clone)]
pub struct FuncRef {
    inner: Arc<FuncInner>,
}

impl FuncRef {
    pub fn new(core: &Core, api: ApiGeneration, func: PublicFunction) -> Self {
        core.function_instance_created();
        Self {
            inner: Arc::new(FuncInner {
                func,
                api,
                core: core.clone(),
            }),
        }
    }

    /// Invoke the callable. Crossing audio-carrying input into a
    /// legacy-generation function fails through the output map.
    pub fn call(&self, input: &PropertyMap, output: &mut PropertyMap) {
        if self.inner.api == ApiGeneration::Legacy && !input.is_legacy_safe() {
            output.set_error("function was passed values that are unknown to its API version");
            return;
        }
        (self.inner.func)(input, output, &self.inner.core);
    }

    pub fn api(&self) -> ApiGeneration {
        self.inner.api
    }
}

/// A registered plugin function: parsed signatures plus the callable.
pub struct PluginFunction {
    name: String,
    args: Vec<FilterArgument>,
    ret_args: Vec<FilterArgument>,
    arg_string: String,
    return_string: String,
    func: PublicFunction,
}

impl PluginFunction {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arguments(&self) -> &[FilterArgument] {
        &self.args
    }

    pub fn return_arguments(&self) -> &[FilterArgument] {
        &self.ret_args
    }

    pub fn arg_string(&self) -> &str {
        &self.arg_string
    }

    pub fn return_string(&self) -> &str {
        &self.return_string
    }

    /// Whether every argument and return type exists in the legacy
    /// generation.
    pub fn is_legacy_compatible(&self) -> bool {
        !self
            .args
            .iter()
            .chain(self.ret_args.iter())
            .any(|a| matches!(a.prop_type, PropType::AudioNode | PropType::AudioFrame))
    }
}

/// A plugin: a namespaced set of registered functions.
pub struct Plugin {
    id: String,
    namespace: String,
    fullname: String,
    version: i32,
    api: ApiGeneration,
    read_only: Mutex<bool>,
    compat: Mutex<bool>,
    functions: Mutex<BTreeMap<String, Arc<PluginFunction>>>,
}

impl Plugin {
    pub(crate) fn new(
        id: &str,
        namespace: &str,
        fullname: &str,
        version: i32,
        api: ApiGeneration,
    ) -> Self {
        Self {
            id: id.to_string(),
            namespace: namespace.to_string(),
            fullname: fullname.to_string(),
            version,
            api,
            read_only: Mutex::new(false),
            compat: Mutex::new(false),
            functions: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn fullname(&self) -> &str {
        &self.fullname
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn api(&self) -> ApiGeneration {
        self.api
    }

    /// Allow this plugin to accept and produce compat color families.
    pub fn enable_compat(&self) {
        *self.compat.lock() = true;
    }

    pub fn is_compat(&self) -> bool {
        *self.compat.lock()
    }

    /// Prevent further function registration.
    pub(crate) fn lock_registration(&self) {
        *self.read_only.lock() = true;
    }

    /// Register a function. Failures are reported at Critical severity
    /// and leave the plugin unchanged.
    pub fn register_function(
        &self,
        core: &Core,
        name: &str,
        args: &str,
        return_type: &str,
        func: PublicFunction,
    ) -> bool {
        use crate::log::MessageSeverity;

        if *self.read_only.lock() {
            core.log_message(
                MessageSeverity::Critical,
                &format!(
                    "API misuse: tried to register function {name} but plugin {} is read only",
                    self.id
                ),
            );
            return false;
        }

        if !is_valid_identifier(name) {
            core.log_message(
                MessageSeverity::Critical,
                &format!(
                    "API misuse: plugin {} tried to register '{name}' which is an illegal identifier",
                    self.id
                ),
            );
            return false;
        }

        let mut functions = self.functions.lock();
        if functions.contains_key(name) {
            core.log_message(
                MessageSeverity::Critical,
                &format!(
                    "API misuse: tried to register function '{name}' more than once for plugin {}",
                    self.id
                ),
            );
            return false;
        }

        let parsed_args = match parse_signature(args, self.api) {
            Ok(parsed) => parsed,
            Err(e) => {
                core.log_message(
                    MessageSeverity::Critical,
                    &format!("API misuse: function '{name}' failed to register with error: {e}"),
                );
                return false;
            }
        };
        let parsed_ret = match parse_signature(return_type, self.api) {
            Ok(parsed) => parsed,
            Err(e) => {
                core.log_message(
                    MessageSeverity::Critical,
                    &format!("API misuse: function '{name}' failed to register with error: {e}"),
                );
                return false;
            }
        };

        functions.insert(
            name.to_string(),
            Arc::new(PluginFunction {
                name: name.to_string(),
                args: parsed_args,
                ret_args: parsed_ret,
                arg_string: args.to_string(),
                return_string: return_type.to_string(),
                func,
            }),
        );
        true
    }

    pub fn function(&self, name: &str) -> Option<Arc<PluginFunction>> {
        self.functions.lock().get(name).cloned()
    }

    /// Registered function names in sorted order.
    pub fn function_names(&self) -> Vec<String> {
        self.functions.lock().keys().cloned().collect()
    }

    /// Invoke a function by name with full argument validation. Errors
    /// come back as the sticky error of the returned map.
    pub fn invoke(&self, core: &Core, func_name: &str, args: &PropertyMap) -> PropertyMap {
        let mut out = PropertyMap::new();

        let Some(function) = self.function(func_name) else {
            out.set_error(&format!(
                "function '{func_name}' not found in {}",
                self.id
            ));
            return out;
        };

        if let Err(msg) = self.check_arguments(&function, func_name, args) {
            out.set_error(&msg);
            return out;
        }

        (function.func)(args, &mut out, core);

        if !self.is_compat() && out.has_compat_nodes() {
            core.log_fatal(&format!(
                "{func_name}: filter node returned compat format but only compat plugins may do so"
            ));
        }
        if self.api == ApiGeneration::Legacy && !out.is_legacy_safe() {
            core.log_fatal(&format!(
                "{func_name}: filter returned a type unknown to its API generation"
            ));
        }

        out
    }

    fn check_arguments(
        &self,
        function: &PluginFunction,
        func_name: &str,
        args: &PropertyMap,
    ) -> Result<(), String> {
        if !self.is_compat() && args.has_compat_nodes() {
            return Err(format!(
                "{func_name}: only compat-enabled plugins may accept compat input"
            ));
        }

        let mut remaining: Vec<&str> = args.keys().collect();

        for declared in &function.args {
            match args.prop_type(&declared.name) {
                Some(actual) => {
                    remaining.retain(|k| *k != declared.name);

                    if actual != declared.prop_type {
                        return Err(format!(
                            "{func_name}: argument {} is not of the correct type",
                            declared.name
                        ));
                    }

                    let len = args.num_elements(&declared.name).unwrap_or(0);
                    if !declared.array && len > 1 {
                        return Err(format!(
                            "{func_name}: argument {} is not of array type but more than one value was supplied",
                            declared.name
                        ));
                    }
                    if !declared.empty && len < 1 {
                        return Err(format!(
                            "{func_name}: argument {} does not accept empty arrays",
                            declared.name
                        ));
                    }
                }
                None => {
                    if !declared.optional {
                        return Err(format!(
                            "{func_name}: argument {} is required",
                            declared.name
                        ));
                    }
                }
            }
        }

        if !remaining.is_empty() {
            return Err(format!(
                "{func_name}: no argument(s) named {}",
                remaining.join(", ")
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_rule() {
        assert!(is_valid_identifier("Resize"));
        assert!(is_valid_identifier("a1_b2"));
        assert!(!is_valid_identifier("_private"));
        assert!(!is_valid_identifier("1clip"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("bad-name"));
    }

    #[test]
    fn parse_simple_signature() {
        let args = parse_signature("clip:vnode;strength:float:opt;", ApiGeneration::Current)
            .expect("valid signature");
        assert_eq!(args.len(), 2);
        assert_eq!(args[0].name, "clip");
        assert_eq!(args[0].prop_type, PropType::VideoNode);
        assert!(!args[0].optional);
        assert!(args[1].optional);
        assert_eq!(args[1].prop_type, PropType::Float);
    }

    #[test]
    fn parse_array_and_empty() {
        let args =
            parse_signature("weights:float[]:empty;", ApiGeneration::Current).expect("valid");
        assert!(args[0].array);
        assert!(args[0].empty);
    }

    #[test]
    fn empty_requires_array() {
        let err = parse_signature("x:int:empty;", ApiGeneration::Current).unwrap_err();
        assert!(err.contains("only array arguments"));
    }

    #[test]
    fn duplicate_modifier_rejected() {
        let err = parse_signature("x:int:opt:opt;", ApiGeneration::Current).unwrap_err();
        assert!(err.contains("duplicate"));
    }

    #[test]
    fn unknown_modifier_rejected() {
        let err = parse_signature("x:int:sometimes;", ApiGeneration::Current).unwrap_err();
        assert!(err.contains("unknown argument modifier"));
    }

    #[test]
    fn incomplete_spec_rejected() {
        let err = parse_signature("x;", ApiGeneration::Current).unwrap_err();
        assert!(err.contains("incomplete"));
    }

    #[test]
    fn generation_gates_type_names() {
        assert!(parse_signature("c:clip;", ApiGeneration::Legacy).is_ok());
        assert!(parse_signature("c:clip;", ApiGeneration::Current).is_err());
        assert!(parse_signature("c:vnode;", ApiGeneration::Legacy).is_err());
        assert!(parse_signature("a:anode;", ApiGeneration::Legacy).is_err());
    }

    #[test]
    fn signature_round_trip() {
        let spec = "clip:vnode;planes:int[]:opt:empty;blur:float:opt;cb:func;";
        let parsed = parse_signature(spec, ApiGeneration::Current).expect("valid");
        let emitted = emit_signature(&parsed, ApiGeneration::Current).expect("emittable");
        assert_eq!(emitted, spec);
        let reparsed = parse_signature(&emitted, ApiGeneration::Current).expect("valid");
        assert_eq!(parsed, reparsed);
    }

    #[test]
    fn legacy_emission_translates_names() {
        let parsed = parse_signature("clip:vnode;f:vframe:opt;", ApiGeneration::Current)
            .expect("valid");
        let legacy = emit_signature(&parsed, ApiGeneration::Legacy).expect("legacy-safe");
        assert_eq!(legacy, "clip:clip;f:frame:opt;");
    }

    #[test]
    fn audio_types_cannot_cross_into_legacy() {
        let parsed = parse_signature("a:anode;", ApiGeneration::Current).expect("valid");
        assert!(emit_signature(&parsed, ApiGeneration::Legacy).is_none());
    }
}
