//! A job template that changes between submissions.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;

use super::JobTemplate;

/// Transforms a job template; called once per step.
///
/// Iterators may block (see [`time_iterator`]), so async callers should
/// advance a [`Template`] from the blocking pool.
pub type TemplateIterator = Box<dyn FnMut(JobTemplate) -> JobTemplate + Send>;

/// A base job template plus named iterators and mappers.
///
/// Not meant to be advanced from several tasks at once.
pub struct Template {
    jt: JobTemplate,
    iterators: HashMap<String, TemplateIterator>,
    mappers: HashMap<String, TemplateIterator>,
}

impl Template {
    pub fn new(jt: JobTemplate) -> Self {
        Self {
            jt,
            iterators: HashMap::new(),
            mappers: HashMap::new(),
        }
    }

    /// The current state of the wrapped template.
    pub fn template(&self) -> &JobTemplate {
        &self.jt
    }

    /// Register an iterator applied on every [`Template::next`]. Iterators
    /// run in no particular order.
    pub fn add_iterator(mut self, name: impl Into<String>, iterator: TemplateIterator) -> Self {
        self.iterators.insert(name.into(), iterator);
        self
    }

    /// Register a mapper that produces a one-off variant of the template.
    pub fn add_map(mut self, name: impl Into<String>, mapper: TemplateIterator) -> Self {
        self.mappers.insert(name.into(), mapper);
        self
    }

    /// Apply every iterator to the wrapped template and return the result.
    pub fn next(&mut self) -> JobTemplate {
        for iterator in self.iterators.values_mut() {
            let current = std::mem::take(&mut self.jt);
            self.jt = iterator(current);
        }
        self.jt.clone()
    }

    /// Advance, then map the new state through mapper `name`.
    pub fn next_map(&mut self, name: &str) -> JobTemplate {
        self.next();
        self.map_to(name)
    }

    /// Copy of the template passed through mapper `name`. The wrapped template
    /// is not changed. Unknown names return a plain copy.
    pub fn map_to(&mut self, name: &str) -> JobTemplate {
        match self.mappers.get_mut(name) {
            Some(mapper) => mapper(self.jt.clone()),
            None => self.jt.clone(),
        }
    }
}

impl std::fmt::Debug for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Template")
            .field("jt", &self.jt)
            .field("iterators", &self.iterators.keys().collect::<Vec<_>>())
            .field("mappers", &self.mappers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Sets `var` in the job environment to `start`, `start + step`, ... on
/// successive calls.
pub fn env_sequence_iterator(var: impl Into<String>, start: i64, step: i64) -> TemplateIterator {
    let var = var.into();
    let mut value = start;
    Box::new(move |mut jt: JobTemplate| {
        jt.job_environment.insert(var.clone(), value.to_string());
        value += step;
        jt
    })
}

/// Returns at most once per `period`, blocking until the next tick. Sets
/// `wfl_iteration` (1-based) and `wfl_time` in the job environment.
pub fn time_iterator(period: Duration) -> TemplateIterator {
    let mut next_tick = Instant::now() + period;
    let mut iteration: u64 = 0;
    Box::new(move |mut jt: JobTemplate| {
        let now = Instant::now();
        if next_tick > now {
            std::thread::sleep(next_tick - now);
        }
        next_tick += period;
        iteration += 1;
        jt.job_environment
            .insert("wfl_iteration".to_string(), iteration.to_string());
        jt.job_environment
            .insert("wfl_time".to_string(), Utc::now().to_rfc3339());
        jt
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_sequence() {
        let mut t = Template::new(JobTemplate::command("env", Vec::<String>::new()))
            .add_iterator("seq", env_sequence_iterator("N", 10, 5));
        assert_eq!(t.next().job_environment["N"], "10");
        assert_eq!(t.next().job_environment["N"], "15");
        assert_eq!(t.template().job_environment["N"], "15");
    }

    #[test]
    fn test_map_does_not_touch_base() {
        let mut t = Template::new(JobTemplate::command("sleep", ["1"]))
            .add_iterator("seq", env_sequence_iterator("N", 0, 1))
            .add_map(
                "container",
                Box::new(|mut jt: JobTemplate| {
                    jt.job_category = "busybox".into();
                    jt
                }),
            );

        let mapped = t.next_map("container");
        assert_eq!(mapped.job_category, "busybox");
        assert_eq!(mapped.job_environment["N"], "0");
        assert_eq!(t.template().job_category, "");

        let unknown = t.map_to("nope");
        assert_eq!(&unknown, t.template());
    }

    #[test]
    fn test_time_iterator_paces_calls() {
        let mut t = Template::new(JobTemplate::command("date", Vec::<String>::new()))
            .add_iterator("tick", time_iterator(Duration::from_millis(20)));
        let start = Instant::now();
        t.next();
        let jt = t.next();
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert_eq!(jt.job_environment["wfl_iteration"], "2");
        assert!(jt.job_environment.contains_key("wfl_time"));
    }
}
