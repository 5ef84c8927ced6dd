//! Plugin registration, invocation validation and generation bridging.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::filters::{test_core, video_info, yuv420p8, ConstantAudio, ConstantVideo};
use frameloom_core::{
    ApiGeneration, AppendMode, ColorFamily, Core, DataItem, FilterMode, FuncRef, MessageSeverity,
    Plugin, PropertyMap, PublicFunction, SampleType, VideoFormat,
};

/// Register a plugin exposing `Blank(width:int;height:int;value:int:opt;)`
/// which creates a constant video clip.
fn register_blank_plugin(core: &Core) -> Arc<Plugin> {
    core.register_plugin(
        "com.frameloom.test",
        "test",
        "Test filters",
        1,
        ApiGeneration::Current,
        true,
        |plugin, core| {
            let func: PublicFunction = Arc::new(|args, out, core| {
                let width = match args.get_int("width", 0) {
                    Ok(w) => w as i32,
                    Err(e) => {
                        out.set_error(&format!("Blank: {e}"));
                        return;
                    }
                };
                let height = match args.get_int("height", 0) {
                    Ok(h) => h as i32,
                    Err(e) => {
                        out.set_error(&format!("Blank: {e}"));
                        return;
                    }
                };
                let value = args.get_int("value", 0).unwrap_or(0) as u8;

                let format = yuv420p8();
                match core.create_video_filter(
                    "Blank",
                    vec![video_info(format, width, height, 100)],
                    FilterMode::Parallel,
                    0,
                    Box::new(ConstantVideo {
                        format,
                        width,
                        height,
                        base: value,
                        delay: None,
                    }),
                ) {
                    Ok(handles) => {
                        for handle in handles {
                            let _ = out.set_node("clip", handle, AppendMode::Append);
                        }
                    }
                    Err(e) => out.set_error(&format!("Blank: {e}")),
                }
            });
            assert!(plugin.register_function(
                core,
                "Blank",
                "width:int;height:int;value:int:opt;",
                "clip:vnode;",
                func,
            ));
        },
    )
    .expect("plugin registration")
}

fn blank_args(width: i64, height: i64) -> PropertyMap {
    let mut args = PropertyMap::new();
    args.set_int("width", width, AppendMode::Replace).unwrap();
    args.set_int("height", height, AppendMode::Replace).unwrap();
    args
}

// ── Invocation ─────────────────────────────────────────────────

#[test]
fn invoke_builds_a_working_filter() {
    let core = test_core(2);
    let plugin = register_blank_plugin(&core);

    let mut args = blank_args(64, 64);
    args.set_int("value", 42, AppendMode::Replace).unwrap();
    let out = core.invoke(&plugin, "Blank", &args);
    assert_eq!(out.error(), None);

    let node = out.get_video_node("clip", 0).expect("node in output");
    let frame = core.get_frame(&node, 0).expect("frame");
    assert!(frame.plane_slice(0).iter().all(|&b| b == 42));

    drop(node);
    core.free();
}

#[test]
fn unknown_function_reports_error() {
    let core = test_core(1);
    let plugin = register_blank_plugin(&core);
    let out = core.invoke(&plugin, "DoesNotExist", &PropertyMap::new());
    let err = out.error().expect("error expected");
    assert!(err.contains("'DoesNotExist' not found in com.frameloom.test"));
    core.free();
}

#[test]
fn missing_required_argument_fails() {
    let core = test_core(1);
    let plugin = register_blank_plugin(&core);
    let mut args = PropertyMap::new();
    args.set_int("width", 64, AppendMode::Replace).unwrap();
    let out = core.invoke(&plugin, "Blank", &args);
    assert!(out.error().expect("error").contains("argument height is required"));
    core.free();
}

#[test]
fn wrong_argument_type_fails() {
    let core = test_core(1);
    let plugin = register_blank_plugin(&core);
    let mut args = blank_args(64, 64);
    args.set_data("value", DataItem::utf8("nope"), AppendMode::Replace)
        .unwrap();
    let out = core.invoke(&plugin, "Blank", &args);
    assert!(out
        .error()
        .expect("error")
        .contains("argument value is not of the correct type"));
    core.free();
}

#[test]
fn scalar_argument_rejects_arrays() {
    let core = test_core(1);
    let plugin = register_blank_plugin(&core);
    let mut args = blank_args(64, 64);
    args.set_int_array("value", &[1, 2]).unwrap();
    let out = core.invoke(&plugin, "Blank", &args);
    assert!(out
        .error()
        .expect("error")
        .contains("not of array type but more than one value was supplied"));
    core.free();
}

#[test]
fn unknown_keys_are_listed_together() {
    let core = test_core(1);
    let plugin = register_blank_plugin(&core);
    let mut args = blank_args(64, 64);
    args.set_int("bogus", 1, AppendMode::Replace).unwrap();
    args.set_int("extra", 2, AppendMode::Replace).unwrap();
    let out = core.invoke(&plugin, "Blank", &args);
    let err = out.error().expect("error");
    assert!(err.contains("no argument(s) named"));
    assert!(err.contains("bogus"));
    assert!(err.contains("extra"));
    core.free();
}

#[test]
fn compat_input_requires_compat_plugin() {
    let core = test_core(1);
    let plugin = register_blank_plugin(&core);

    // A node whose output is a compat color family.
    let compat_format =
        VideoFormat::query(ColorFamily::CompatBgr32, SampleType::Integer, 32, 0, 0).unwrap();
    let compat_node = core
        .create_video_filter(
            "CompatSource",
            vec![video_info(compat_format, 64, 64, 10)],
            FilterMode::Parallel,
            0,
            Box::new(ConstantVideo {
                format: compat_format,
                width: 64,
                height: 64,
                base: 0,
                delay: None,
            }),
        )
        .expect("filter creation")
        .remove(0);

    let mut args = blank_args(64, 64);
    args.set_node("src", compat_node, AppendMode::Replace).unwrap();
    let out = core.invoke(&plugin, "Blank", &args);
    assert!(out
        .error()
        .expect("error")
        .contains("only compat-enabled plugins may accept compat input"));
    core.free();
}

// ── Registration rules ─────────────────────────────────────────

#[test]
fn registration_respects_identifier_rule() {
    let core = test_core(1);
    let criticals = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&criticals);
    core.add_message_handler(move |severity, _| {
        if severity == MessageSeverity::Critical {
            seen.fetch_add(1, Ordering::Relaxed);
        }
    });

    core.register_plugin(
        "com.frameloom.reg",
        "reg",
        "Registration tests",
        1,
        ApiGeneration::Current,
        false,
        |plugin, core| {
            let noop: PublicFunction = Arc::new(|_, _, _| {});

            assert!(plugin.register_function(core, "Good", "x:int;", "", Arc::clone(&noop)));
            assert!(plugin.register_function(core, "Good2", "x:int;", "", Arc::clone(&noop)));
            // Leading underscore and digits violate the identifier rule.
            assert!(!plugin.register_function(core, "_Bad", "x:int;", "", Arc::clone(&noop)));
            assert!(!plugin.register_function(core, "2Bad", "x:int;", "", Arc::clone(&noop)));
            // Duplicate name.
            assert!(!plugin.register_function(core, "Good", "x:int;", "", Arc::clone(&noop)));
            // Broken signature.
            assert!(!plugin.register_function(core, "BadSig", "x:int:opt:opt;", "", noop));
        },
    )
    .expect("plugin registration");

    assert_eq!(criticals.load(Ordering::Relaxed), 4);
    core.free();
}

#[test]
fn read_only_plugin_rejects_late_registration() {
    let core = test_core(1);
    let plugin = register_blank_plugin(&core);
    let noop: PublicFunction = Arc::new(|_, _, _| {});
    assert!(!plugin.register_function(&core, "Late", "x:int;", "", noop));
    core.free();
}

// ── Generation bridging ────────────────────────────────────────

#[test]
fn legacy_function_rejects_audio_input() {
    let core = test_core(1);
    let called = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&called);
    let func: PublicFunction = Arc::new(move |_, _, _| {
        count.fetch_add(1, Ordering::Relaxed);
    });
    let func_ref = FuncRef::new(&core, ApiGeneration::Legacy, func);

    let audio_node = ConstantAudio::node(&core, 4096);
    let mut input = PropertyMap::new();
    input.set_node("a", audio_node, AppendMode::Replace).unwrap();

    let mut output = PropertyMap::new();
    func_ref.call(&input, &mut output);
    assert!(output
        .error()
        .expect("error")
        .contains("unknown to its API version"));
    assert_eq!(called.load(Ordering::Relaxed), 0);

    // The same input passes into a current-generation callable.
    let count = Arc::clone(&called);
    let func: PublicFunction = Arc::new(move |_, _, _| {
        count.fetch_add(1, Ordering::Relaxed);
    });
    let current_ref = FuncRef::new(&core, ApiGeneration::Current, func);
    let mut input2 = PropertyMap::new();
    let audio_node = ConstantAudio::node(&core, 4096);
    input2.set_node("a", audio_node, AppendMode::Replace).unwrap();
    let mut output2 = PropertyMap::new();
    current_ref.call(&input2, &mut output2);
    assert_eq!(output2.error(), None);
    assert_eq!(called.load(Ordering::Relaxed), 1);

    drop((func_ref, current_ref));
    core.free();
}

#[test]
fn legacy_generation_parses_legacy_type_names() {
    let core = test_core(1);
    core.register_plugin(
        "com.frameloom.legacy",
        "legacy",
        "Legacy plugin",
        1,
        ApiGeneration::Legacy,
        false,
        |plugin, core| {
            let noop: PublicFunction = Arc::new(|_, _, _| {});
            assert!(plugin.register_function(
                core,
                "Invert",
                "clip:clip;planes:int[]:opt;",
                "clip:clip;",
                Arc::clone(&noop),
            ));
            // Current-generation names are unknown to a legacy plugin.
            assert!(!plugin.register_function(core, "Invert2", "clip:vnode;", "", noop));
        },
    )
    .expect("plugin registration");
    core.free();
}
