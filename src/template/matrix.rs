//! Parametric expansion of a template into one template per matrix point.
//!
//! A [`Replacement`] names template fields, a pattern, and the values the
//! pattern is replaced with. Two replacements span a matrix; every point
//! yields a fresh copy of the base template with both applied.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::JobTemplate;
use crate::error::TemplateError;

/// Symbolic names of the template fields a replacement can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobTemplateField {
    RemoteCommand,
    Args,
    SubmitAsHold,
    ReRunnable,
    JobEnvironment,
    WorkingDirectory,
    JobCategory,
    Email,
    EmailOnStarted,
    EmailOnTerminated,
    JobName,
    InputPath,
    OutputPath,
    ErrorPath,
    JoinFiles,
    ReservationID,
    QueueName,
    MinSlots,
    MaxSlots,
    Priority,
    CandidateMachines,
    MinPhysMemory,
    MachineOS,
    MachineArch,
    StartTime,
    DeadlineTime,
    StageInFiles,
    StageOutFiles,
    ResourceLimits,
    AccountingID,
    ExtensionList,
}

impl JobTemplateField {
    pub const ALL: [JobTemplateField; 31] = [
        Self::RemoteCommand,
        Self::Args,
        Self::SubmitAsHold,
        Self::ReRunnable,
        Self::JobEnvironment,
        Self::WorkingDirectory,
        Self::JobCategory,
        Self::Email,
        Self::EmailOnStarted,
        Self::EmailOnTerminated,
        Self::JobName,
        Self::InputPath,
        Self::OutputPath,
        Self::ErrorPath,
        Self::JoinFiles,
        Self::ReservationID,
        Self::QueueName,
        Self::MinSlots,
        Self::MaxSlots,
        Self::Priority,
        Self::CandidateMachines,
        Self::MinPhysMemory,
        Self::MachineOS,
        Self::MachineArch,
        Self::StartTime,
        Self::DeadlineTime,
        Self::StageInFiles,
        Self::StageOutFiles,
        Self::ResourceLimits,
        Self::AccountingID,
        Self::ExtensionList,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::RemoteCommand => "RemoteCommand",
            Self::Args => "Args",
            Self::SubmitAsHold => "SubmitAsHold",
            Self::ReRunnable => "ReRunnable",
            Self::JobEnvironment => "JobEnvironment",
            Self::WorkingDirectory => "WorkingDirectory",
            Self::JobCategory => "JobCategory",
            Self::Email => "Email",
            Self::EmailOnStarted => "EmailOnStarted",
            Self::EmailOnTerminated => "EmailOnTerminated",
            Self::JobName => "JobName",
            Self::InputPath => "InputPath",
            Self::OutputPath => "OutputPath",
            Self::ErrorPath => "ErrorPath",
            Self::JoinFiles => "JoinFiles",
            Self::ReservationID => "ReservationID",
            Self::QueueName => "QueueName",
            Self::MinSlots => "MinSlots",
            Self::MaxSlots => "MaxSlots",
            Self::Priority => "Priority",
            Self::CandidateMachines => "CandidateMachines",
            Self::MinPhysMemory => "MinPhysMemory",
            Self::MachineOS => "MachineOS",
            Self::MachineArch => "MachineArch",
            Self::StartTime => "StartTime",
            Self::DeadlineTime => "DeadlineTime",
            Self::StageInFiles => "StageInFiles",
            Self::StageOutFiles => "StageOutFiles",
            Self::ResourceLimits => "ResourceLimits",
            Self::AccountingID => "AccountingID",
            Self::ExtensionList => "ExtensionList",
        }
    }

    fn slot<'a>(&self, jt: &'a mut JobTemplate) -> FieldSlot<'a> {
        match self {
            Self::RemoteCommand => FieldSlot::Text(&mut jt.remote_command),
            Self::Args => FieldSlot::List(&mut jt.args),
            Self::SubmitAsHold => FieldSlot::Flag(&mut jt.submit_as_hold),
            Self::ReRunnable => FieldSlot::Flag(&mut jt.rerunnable),
            Self::JobEnvironment => FieldSlot::Map(&mut jt.job_environment),
            Self::WorkingDirectory => FieldSlot::Text(&mut jt.working_directory),
            Self::JobCategory => FieldSlot::Text(&mut jt.job_category),
            Self::Email => FieldSlot::List(&mut jt.email),
            Self::EmailOnStarted => FieldSlot::Flag(&mut jt.email_on_started),
            Self::EmailOnTerminated => FieldSlot::Flag(&mut jt.email_on_terminated),
            Self::JobName => FieldSlot::Text(&mut jt.job_name),
            Self::InputPath => FieldSlot::Text(&mut jt.input_path),
            Self::OutputPath => FieldSlot::Text(&mut jt.output_path),
            Self::ErrorPath => FieldSlot::Text(&mut jt.error_path),
            Self::JoinFiles => FieldSlot::Flag(&mut jt.join_files),
            Self::ReservationID => FieldSlot::Text(&mut jt.reservation_id),
            Self::QueueName => FieldSlot::Text(&mut jt.queue_name),
            Self::MinSlots => FieldSlot::Number(&mut jt.min_slots),
            Self::MaxSlots => FieldSlot::Number(&mut jt.max_slots),
            Self::Priority => FieldSlot::Number(&mut jt.priority),
            Self::CandidateMachines => FieldSlot::List(&mut jt.candidate_machines),
            Self::MinPhysMemory => FieldSlot::Number(&mut jt.min_phys_memory),
            Self::MachineOS => FieldSlot::Text(&mut jt.machine_os),
            Self::MachineArch => FieldSlot::Text(&mut jt.machine_arch),
            Self::StartTime => FieldSlot::Time(&mut jt.start_time),
            Self::DeadlineTime => FieldSlot::Time(&mut jt.deadline_time),
            Self::StageInFiles => FieldSlot::Map(&mut jt.stage_in_files),
            Self::StageOutFiles => FieldSlot::Map(&mut jt.stage_out_files),
            Self::ResourceLimits => FieldSlot::Map(&mut jt.resource_limits),
            Self::AccountingID => FieldSlot::Text(&mut jt.accounting_id),
            Self::ExtensionList => FieldSlot::Map(&mut jt.extension_list),
        }
    }
}

impl FromStr for JobTemplateField {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|f| f.name() == s)
            .copied()
            .ok_or_else(|| TemplateError::UnknownField(s.to_string()))
    }
}

impl std::fmt::Display for JobTemplateField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Typed mutable view on one template field.
enum FieldSlot<'a> {
    Text(&'a mut String),
    Flag(&'a mut bool),
    Number(&'a mut i64),
    List(&'a mut Vec<String>),
    Map(&'a mut HashMap<String, String>),
    Time(&'a mut Option<DateTime<Utc>>),
}

/// One axis of a template matrix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replacement {
    /// Fields searched for `pattern`.
    pub fields: Vec<JobTemplateField>,
    pub pattern: String,
    /// One template is generated per value.
    pub replacements: Vec<String>,
}

impl Replacement {
    pub fn new<I, S>(fields: &[JobTemplateField], pattern: impl Into<String>, replacements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.to_vec(),
            pattern: pattern.into(),
            replacements: replacements.into_iter().map(Into::into).collect(),
        }
    }

    /// Build a replacement from symbolic field names.
    pub fn from_names<I, S>(
        names: &[&str],
        pattern: impl Into<String>,
        replacements: I,
    ) -> Result<Self, TemplateError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields = names
            .iter()
            .map(|n| n.parse())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(&fields, pattern, replacements))
    }

    fn apply(&self, jt: &mut JobTemplate, value: &str) -> Result<(), TemplateError> {
        for field in &self.fields {
            replace_in_field(jt, *field, &self.pattern, value)?;
        }
        Ok(())
    }
}

/// Apply one `pattern -> replacement` substitution to `field` of `jt`.
///
/// Text, list and map fields get every occurrence replaced (maps in keys and
/// values). Flags, numbers and timestamps are overwritten with the parsed
/// replacement.
pub fn replace_in_field(
    jt: &mut JobTemplate,
    field: JobTemplateField,
    pattern: &str,
    replacement: &str,
) -> Result<(), TemplateError> {
    let invalid = |reason: String| TemplateError::InvalidReplacement {
        field: field.name().to_string(),
        value: replacement.to_string(),
        reason,
    };

    match field.slot(jt) {
        FieldSlot::Text(s) => *s = s.replace(pattern, replacement),
        FieldSlot::Flag(b) => {
            *b = parse_flag(replacement)
                .ok_or_else(|| invalid("expected a boolean such as true, T, 1 or false, F, 0".into()))?;
        }
        FieldSlot::Number(n) => {
            *n = replacement
                .trim()
                .parse::<i64>()
                .map_err(|e| invalid(e.to_string()))?;
        }
        FieldSlot::List(items) => {
            for item in items.iter_mut() {
                *item = item.replace(pattern, replacement);
            }
        }
        FieldSlot::Map(map) => {
            *map = map
                .drain()
                .map(|(k, v)| (k.replace(pattern, replacement), v.replace(pattern, replacement)))
                .collect();
        }
        FieldSlot::Time(t) => {
            let parsed = DateTime::parse_from_rfc3339(replacement.trim())
                .map_err(|e| invalid(e.to_string()))?;
            *t = Some(parsed.with_timezone(&Utc));
        }
    }
    Ok(())
}

/// Boolean spellings accepted for flag replacements.
fn parse_flag(s: &str) -> Option<bool> {
    match s {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Increment a digit vector whose last position is the least significant.
///
/// `max[i]` is the highest value position `i` may take. Returns the next
/// value, or `TemplateError::Overflow` once every combination has been
/// visited.
pub fn next_value(max: &[usize], current: &[usize]) -> Result<Vec<usize>, TemplateError> {
    if max.len() != current.len() {
        return Err(TemplateError::Dimensions(format!(
            "max has {} positions, current has {}",
            max.len(),
            current.len()
        )));
    }
    if let Some(i) = (0..max.len()).find(|&i| max[i] < current[i]) {
        return Err(TemplateError::Dimensions(format!(
            "position {i} is {} but may be at most {}",
            current[i], max[i]
        )));
    }

    let mut next = current.to_vec();
    for i in (0..next.len()).rev() {
        next[i] += 1;
        if next[i] > max[i] {
            next[i] = 0;
            continue;
        }
        return Ok(next);
    }
    Err(TemplateError::Overflow)
}

/// Expand `jt` over the cartesian product of `x` and `y`.
///
/// If both replacement lists are empty nothing is produced. If only one is
/// empty, the matrix degenerates to the other axis and the empty axis is not
/// applied.
pub fn templates_for_matrix(
    jt: &JobTemplate,
    x: &Replacement,
    y: &Replacement,
) -> Result<Vec<JobTemplate>, TemplateError> {
    let axes: Vec<&Replacement> = [x, y]
        .into_iter()
        .filter(|r| !r.replacements.is_empty())
        .collect();
    if axes.is_empty() {
        return Ok(Vec::new());
    }

    let max: Vec<usize> = axes.iter().map(|r| r.replacements.len() - 1).collect();
    let mut position = vec![0; axes.len()];
    let mut templates = Vec::with_capacity(max.iter().map(|m| m + 1).product());

    loop {
        let mut point = jt.clone();
        for (axis, &idx) in axes.iter().zip(&position) {
            axis.apply(&mut point, &axis.replacements[idx])?;
        }
        templates.push(point);

        position = match next_value(&max, &position) {
            Ok(next) => next,
            Err(TemplateError::Overflow) => break,
            Err(e) => return Err(e),
        };
    }
    Ok(templates)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_value_visits_everything_in_order() {
        let max = [1, 2, 1];
        let mut cur = vec![0, 0, 0];
        let mut seen = vec![cur.clone()];
        loop {
            match next_value(&max, &cur) {
                Ok(next) => {
                    seen.push(next.clone());
                    cur = next;
                }
                Err(e) => {
                    assert_eq!(e, TemplateError::Overflow);
                    break;
                }
            }
        }
        assert_eq!(seen.len(), 2 * 3 * 2);
        let mut sorted = seen.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted, seen);
    }

    #[test]
    fn test_next_value_rejects_bad_input() {
        assert!(matches!(
            next_value(&[1, 1], &[0]),
            Err(TemplateError::Dimensions(_))
        ));
        assert!(matches!(
            next_value(&[1], &[2]),
            Err(TemplateError::Dimensions(_))
        ));
        assert_eq!(next_value(&[0], &[0]), Err(TemplateError::Overflow));
    }

    #[test]
    fn test_replace_in_each_field_kind() {
        let mut jt = JobTemplate {
            remote_command: "app_{{v}}".into(),
            args: vec!["--x={{v}}".into(), "plain".into()],
            job_environment: [("K_{{v}}".to_string(), "V_{{v}}".to_string())].into(),
            ..Default::default()
        };
        replace_in_field(&mut jt, JobTemplateField::RemoteCommand, "{{v}}", "1").unwrap();
        replace_in_field(&mut jt, JobTemplateField::Args, "{{v}}", "2").unwrap();
        replace_in_field(&mut jt, JobTemplateField::JobEnvironment, "{{v}}", "3").unwrap();
        replace_in_field(&mut jt, JobTemplateField::SubmitAsHold, "", "true").unwrap();
        replace_in_field(&mut jt, JobTemplateField::MaxSlots, "", "8").unwrap();

        assert_eq!(jt.remote_command, "app_1");
        assert_eq!(jt.args, vec!["--x=2".to_string(), "plain".to_string()]);
        assert_eq!(jt.job_environment["K_3"], "V_3");
        assert!(jt.submit_as_hold);
        assert_eq!(jt.max_slots, 8);

        let err = replace_in_field(&mut jt, JobTemplateField::ReRunnable, "", "maybe");
        assert!(matches!(err, Err(TemplateError::InvalidReplacement { .. })));
        let err = replace_in_field(&mut jt, JobTemplateField::Priority, "", "high");
        assert!(matches!(err, Err(TemplateError::InvalidReplacement { .. })));
    }

    #[test]
    fn test_flag_spellings() {
        let mut jt = JobTemplate::default();
        for (value, expected) in [
            ("1", true),
            ("t", true),
            ("T", true),
            ("TRUE", true),
            ("True", true),
            ("0", false),
            ("f", false),
            ("F", false),
            ("FALSE", false),
            ("False", false),
        ] {
            jt.join_files = !expected;
            replace_in_field(&mut jt, JobTemplateField::JoinFiles, "", value).unwrap();
            assert_eq!(jt.join_files, expected, "{value}");
        }
        for bad in ["yes", "tRuE", " true", "2", ""] {
            let err = replace_in_field(&mut jt, JobTemplateField::JoinFiles, "", bad);
            assert!(matches!(err, Err(TemplateError::InvalidReplacement { .. })), "{bad}");
        }
    }

    #[test]
    fn test_field_names() {
        assert_eq!(
            "OutputPath".parse::<JobTemplateField>().unwrap(),
            JobTemplateField::OutputPath
        );
        assert!(matches!(
            "NoSuchField".parse::<JobTemplateField>(),
            Err(TemplateError::UnknownField(_))
        ));
        for field in JobTemplateField::ALL {
            assert_eq!(field.name().parse::<JobTemplateField>().unwrap(), field);
        }
    }

    #[test]
    fn test_matrix_product() {
        let jt = JobTemplate::command("{{C}}", ["{{A}}"]);
        let x = Replacement::new(&[JobTemplateField::RemoteCommand], "{{C}}", ["sleep", "echo"]);
        let y = Replacement::new(&[JobTemplateField::Args], "{{A}}", ["0.1", "0.2"]);

        let templates = templates_for_matrix(&jt, &x, &y).unwrap();
        let mut points: Vec<(String, String)> = templates
            .iter()
            .map(|t| (t.remote_command.clone(), t.args[0].clone()))
            .collect();
        points.sort();
        assert_eq!(
            points,
            vec![
                ("echo".to_string(), "0.1".to_string()),
                ("echo".to_string(), "0.2".to_string()),
                ("sleep".to_string(), "0.1".to_string()),
                ("sleep".to_string(), "0.2".to_string()),
            ]
        );
        // base template is untouched
        assert_eq!(jt.remote_command, "{{C}}");
    }

    #[test]
    fn test_matrix_degenerate_axes() {
        let jt = JobTemplate::command("{{C}}", ["{{A}}"]);
        let empty = Replacement::default();
        assert!(templates_for_matrix(&jt, &empty, &empty).unwrap().is_empty());

        let y = Replacement::new(&[JobTemplateField::Args], "{{A}}", ["1", "2", "3"]);
        let templates = templates_for_matrix(&jt, &empty, &y).unwrap();
        assert_eq!(templates.len(), 3);
        assert!(templates.iter().all(|t| t.remote_command == "{{C}}"));
    }
}
