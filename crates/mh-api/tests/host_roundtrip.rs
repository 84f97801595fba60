use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use mh_api::{create_runner, create_runner_pool, CreateHostOptions};
use mh_core::{HostError, HostValue, InvocationContext};
use mh_runtime::MemoryFileStore;

fn sources(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

#[test]
fn pooled_runners_serve_crypto_digests() {
    let (pool, metas) = create_runner_pool(
        CreateHostOptions {
            sources: sources(&[(
                "digest.rhai",
                r#"
                let crypto = require("host/crypto");
                exports.meta = #{ id: "digest" };
                exports["default"] = |arg| crypto.sha256.call(arg);
                "#,
            )]),
            ..CreateHostOptions::default()
        },
        2,
    )
    .expect("pool builds");

    assert_eq!(
        metas[0].get("id"),
        Some(&HostValue::String("digest".to_string()))
    );

    let runner = pool.acquire();
    let result = runner
        .run_method(
            &InvocationContext::background(),
            "digest",
            HostValue::String("abc".to_string()),
        )
        .expect("digest runs");
    assert_eq!(
        result,
        HostValue::String(
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad".to_string()
        )
    );
}

#[test]
fn deadlines_cut_off_runaway_methods() {
    let runner = create_runner(CreateHostOptions {
        sources: sources(&[(
            "spin.rhai",
            r#"
            exports["default"] = |arg| {
                let n = 0;
                while true { n += 1; }
                n
            };
            "#,
        )]),
        ..CreateHostOptions::default()
    })
    .expect("runner builds");

    let ctx = InvocationContext::with_timeout(Duration::from_millis(10));
    let error = runner
        .run_default(&ctx, HostValue::Null)
        .expect_err("deadline fires");
    assert_eq!(error, HostError::Timeout("default".to_string()));
}

#[test]
fn nested_modules_resolve_through_the_store() {
    let store = MemoryFileStore::new();
    store.insert("lib/strings.rhai", "exports.shout = |text| text + \"!\";");
    store.insert(
        "lib/format.rhai",
        r#"
        let strings = require("./strings.rhai");
        exports.greet = strings.shout;
        "#,
    );

    let runner = create_runner(CreateHostOptions {
        sources: sources(&[(
            "main.rhai",
            r#"
            let format = require("lib/format.rhai");
            exports["default"] = |arg| format.greet.call(arg);
            "#,
        )]),
        store: Some(Arc::new(store)),
        ..CreateHostOptions::default()
    })
    .expect("runner builds");

    assert_eq!(
        runner
            .run_default(
                &InvocationContext::background(),
                HostValue::String("hey".to_string())
            )
            .expect("default runs"),
        HostValue::String("hey!".to_string())
    );
}
