//! Source-keys: opaque producers of compute-program source text.
//!
//! The engine never inspects kernel source. A [`KernelSource`] hands over
//! its ordered fragments on demand; the program cache concatenates them,
//! builds the result, and files the outcome under a digest of the text.

/// A compute-program source generator.
pub trait KernelSource: Send + Sync {
    /// Produce the ordered source fragments for this program. Fragments
    /// are concatenated verbatim.
    fn generate_source(&self) -> Vec<String>;

    /// The second-phase variant used by two-stage reductions, built from
    /// the same kernel entry name. Map-only sources return `None`.
    fn stage2(&self) -> Option<Box<dyn KernelSource>> {
        None
    }
}

/// A source-key over fixed text, for callers whose generators are not
/// parameterised (and for tests).
#[derive(Debug, Clone)]
pub struct StaticSource {
    fragments: Vec<String>,
    second: Option<Vec<String>>,
}

impl StaticSource {
    /// A single-phase source.
    #[must_use]
    pub fn new<S: Into<String>>(fragments: impl IntoIterator<Item = S>) -> Self {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            second: None,
        }
    }

    /// A two-phase source, as reduction kernels need.
    #[must_use]
    pub fn with_stage2<S: Into<String>>(mut self, fragments: impl IntoIterator<Item = S>) -> Self {
        self.second = Some(fragments.into_iter().map(Into::into).collect());
        self
    }
}

impl KernelSource for StaticSource {
    fn generate_source(&self) -> Vec<String> {
        self.fragments.clone()
    }

    fn stage2(&self) -> Option<Box<dyn KernelSource>> {
        self.second
            .as_ref()
            .map(|fragments| Box::new(StaticSource::new(fragments.clone())) as Box<dyn KernelSource>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragments_come_back_in_order() {
        let source = StaticSource::new(["a", "b", "c"]);
        assert_eq!(source.generate_source(), vec!["a", "b", "c"]);
        assert!(source.stage2().is_none());
    }

    #[test]
    fn stage2_is_its_own_source() {
        let source = StaticSource::new(["first"]).with_stage2(["second"]);
        let stage2 = source.stage2().expect("stage2 present");
        assert_eq!(stage2.generate_source(), vec!["second"]);
        // The second phase has no third phase.
        assert!(stage2.stage2().is_none());
    }
}
