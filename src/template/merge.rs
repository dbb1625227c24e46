//! Combining a per-submission template with a session default.

use std::collections::HashMap;

use super::JobTemplate;

/// Fill the unset parts of `req` from `def`.
///
/// Scalar strings and the working directory take `def`'s value when empty in
/// `req`. Candidate machines and the extension list are copied wholesale only
/// when `req` has none. Stage-in files and the job environment are merged key
/// by key with `req` winning. Slot counts are taken from `def` when `req`
/// leaves them at zero. Everything else is left as requested.
pub fn merge_with_default(req: &JobTemplate, def: &JobTemplate) -> JobTemplate {
    let mut merged = req.clone();

    for (dst, src) in [
        (&mut merged.job_category, &def.job_category),
        (&mut merged.input_path, &def.input_path),
        (&mut merged.output_path, &def.output_path),
        (&mut merged.error_path, &def.error_path),
        (&mut merged.accounting_id, &def.accounting_id),
        (&mut merged.job_name, &def.job_name),
        (&mut merged.working_directory, &def.working_directory),
    ] {
        if dst.is_empty() {
            dst.clone_from(src);
        }
    }

    if merged.candidate_machines.is_empty() {
        merged.candidate_machines.clone_from(&def.candidate_machines);
    }
    if merged.extension_list.is_empty() {
        merged.extension_list.clone_from(&def.extension_list);
    }

    merge_string_map(&mut merged.stage_in_files, &def.stage_in_files);
    merge_string_map(&mut merged.job_environment, &def.job_environment);

    if merged.min_slots == 0 && def.min_slots > 0 {
        merged.min_slots = def.min_slots;
    }
    if merged.max_slots == 0 && def.max_slots > 0 {
        merged.max_slots = def.max_slots;
    }

    merged
}

fn merge_string_map(dst: &mut HashMap<String, String>, src: &HashMap<String, String>) {
    for (k, v) in src {
        dst.entry(k.clone()).or_insert_with(|| v.clone());
    }
}
