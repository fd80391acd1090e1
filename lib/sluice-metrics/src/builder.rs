use metrics::{counter, Counter, Label, Level, SharedString};

/// Registers metrics that share a common set of tags.
///
/// Components create one builder carrying their identifying tags, then register every handle they need through it.
/// Handles are registered against whichever recorder is current at the time, so they should be created once, up
/// front, and kept.
#[derive(Clone, Debug, Default)]
pub struct MetricsBuilder {
    tags: Vec<Label>,
}

impl MetricsBuilder {
    /// Adds a tag applied to every metric registered through this builder.
    pub fn with_tag(mut self, key: &'static str, value: impl Into<SharedString>) -> Self {
        self.tags.push(Label::new(key, value));
        self
    }

    fn tags_with<I, V>(&self, extra: I) -> Vec<Label>
    where
        I: IntoIterator<Item = (&'static str, V)>,
        V: Into<SharedString>,
    {
        let mut tags = self.tags.clone();
        tags.extend(extra.into_iter().map(|(key, value)| Label::new(key, value)));
        tags
    }

    /// Registers a counter.
    pub fn register_counter(&self, name: &'static str) -> Counter {
        counter!(level: Level::INFO, name, self.tags.clone())
    }

    /// Registers a counter, distinguished from others of the same name by additional tags.
    pub fn register_counter_with_tags<I, V>(&self, name: &'static str, tags: I) -> Counter
    where
        I: IntoIterator<Item = (&'static str, V)>,
        V: Into<SharedString>,
    {
        counter!(level: Level::INFO, name, self.tags_with(tags))
    }

    /// Registers a counter only worth recording when debugging.
    pub fn register_debug_counter(&self, name: &'static str) -> Counter {
        counter!(level: Level::DEBUG, name, self.tags.clone())
    }
}
