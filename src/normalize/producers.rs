//! Reducers for the producers we know by name.

use serde_json::{Map, Value};

use super::{Envelope, Normalizer, ReduceInput, coerce_list_opt};

pub(super) fn register_builtin(normalizer: &mut Normalizer) {
    normalizer
        .register("forusall-upload", upload)
        .register("forusall-mfa-reset", mfa_reset)
        .register("forusall-search", search)
        .register("forusall-emailtrigger", email_trigger);
}

/// Keys that never end up in `data`.
const ENVELOPE_KEYS: [&str; 6] = ["ok", "message", "warnings", "errors", "details", "code"];

/// Failure errors: producer `details` and `errors`, then the job's own error.
fn failure_errors(input: &ReduceInput<'_>) -> Vec<Value> {
    let mut errors = coerce_list_opt(input.field("details"));
    errors.extend(coerce_list_opt(input.field("errors")));
    errors.extend(input.context_errors());
    errors
}

fn failure_message(input: &ReduceInput<'_>) -> Option<String> {
    input
        .str_field("message")
        .map(str::to_string)
        .or_else(|| input.context_message())
}

/// Explicit `ok:false` is a failure even when the job itself finished.
fn reported_ok(input: &ReduceInput<'_>) -> bool {
    input.succeeded && input.bool_field("ok").unwrap_or(true)
}

fn upload(input: &ReduceInput<'_>) -> Envelope {
    if !reported_ok(input) {
        return Envelope::new(false, "UPLOAD_ERROR")
            .message(failure_message(input))
            .data(input.rest(&ENVELOPE_KEYS))
            .warnings(coerce_list_opt(input.field("warnings")))
            .errors(failure_errors(input));
    }
    Envelope::new(true, "UPLOAD_OK")
        .message(input.str_field("message").map(str::to_string))
        .data(input.rest(&ENVELOPE_KEYS))
        .warnings(coerce_list_opt(input.field("warnings")))
}

fn mfa_reset(input: &ReduceInput<'_>) -> Envelope {
    if !reported_ok(input) {
        return Envelope::new(false, "MFA_RESET_ERROR")
            .message(failure_message(input))
            .errors(failure_errors(input));
    }
    let warnings = coerce_list_opt(input.field("warnings"));
    let data = input.rest(&ENVELOPE_KEYS);
    if input.bool_field("mfa") == Some(false) {
        return Envelope::new(true, "MFA_NOT_ENROLLED")
            .message(Some(
                input
                    .str_field("message")
                    .unwrap_or("participant has no MFA enrolled")
                    .to_string(),
            ))
            .data(data)
            .warnings(warnings);
    }
    Envelope::new(true, "MFA_RESET_OK")
        .message(input.str_field("message").map(str::to_string))
        .data(data)
        .warnings(warnings)
}

fn search(input: &ReduceInput<'_>) -> Envelope {
    if !reported_ok(input) {
        return Envelope::new(false, "SEARCH_ERROR")
            .message(failure_message(input))
            .errors(failure_errors(input));
    }

    let results = ["results", "items", "rows"]
        .iter()
        .find_map(|key| input.field(key).and_then(Value::as_array));

    let mut data = input
        .rest(&["ok", "message", "warnings", "errors", "results", "items", "rows"])
        .unwrap_or_default();
    let code = match results {
        Some(rows) if rows.is_empty() => "SEARCH_NO_RESULTS",
        _ => "SEARCH_OK",
    };
    if let Some(rows) = results {
        data.insert("count".to_string(), Value::from(rows.len()));
        data.insert("results".to_string(), Value::Array(rows.clone()));
    }

    Envelope::new(true, code)
        .message(input.str_field("message").map(str::to_string))
        .data(Some(data))
        .warnings(coerce_list_opt(input.field("warnings")))
}

/// Reports success as free text; anything mentioning "succeed" counts.
fn email_trigger(input: &ReduceInput<'_>) -> Envelope {
    let result = input.str_field("result");
    let ok = input.succeeded
        && match result {
            Some(text) => text.to_ascii_lowercase().contains("succeed"),
            None => input.bool_field("ok").unwrap_or(true),
        };

    let data: Option<Map<String, Value>> = input.rest(&["result", "ok", "warnings", "errors"]);
    let warnings = coerce_list_opt(input.field("warnings"));
    if ok {
        return Envelope::new(true, "EMAIL_TRIGGER_OK")
            .message(result.map(str::to_string))
            .data(data)
            .warnings(warnings);
    }

    let mut errors: Vec<Value> = result.map(Value::from).into_iter().collect();
    errors.extend(coerce_list_opt(input.field("errors")));
    errors.extend(input.context_errors());
    Envelope::new(false, "EMAIL_TRIGGER_FAILED")
        .message(
            result
                .map(str::to_string)
                .or_else(|| input.context_message()),
        )
        .data(data)
        .warnings(warnings)
        .errors(errors)
}
