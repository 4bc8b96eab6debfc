use std::fmt;

use tracing::debug;

use crate::utils::{group_thousands, percent_of};

const RULE_WIDTH: usize = 50;
const LABEL_WIDTH: usize = 20;

/// Opaque handle identifying the storage behind a parameter.
///
/// Two records carrying the same id share memory (weight tying).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageId(pub u64);

/// One named parameter as seen by the counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamRecord {
    pub name: String,
    pub numel: u64,
    pub storage: StorageId,
}

impl ParamRecord {
    pub fn new(name: impl Into<String>, numel: u64, storage: StorageId) -> Self {
        Self {
            name: name.into(),
            numel,
            storage,
        }
    }
}

/// Anything that can enumerate its named parameters.
///
/// The element counts must sum to at most `u64::MAX`; loaders check this
/// when the source is built.
pub trait ParameterSource {
    /// Parameters in model order.
    fn named_parameters(&self) -> impl Iterator<Item = ParamRecord> + '_;

    /// Storage of the input embedding weight, used to detect a tied output head.
    /// `None` when the model has no designated embedding.
    fn embedding_storage(&self) -> Option<StorageId>;
}

/// Bucket a parameter falls into. Variants are listed in matching priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Embeddings,
    Attention,
    Mlp,
    Norms,
    LmHead,
    Other,
}

impl Category {
    /// First rule that matches the parameter name wins.
    pub fn classify(name: &str) -> Self {
        if name.contains("embed") {
            Category::Embeddings
        } else if name.contains("attn") {
            Category::Attention
        } else if name.contains("mlp") || name.contains("swiglu") {
            Category::Mlp
        } else if name.contains("ln") || name.contains("norm") {
            Category::Norms
        } else if name.contains("lm_head") {
            Category::LmHead
        } else {
            Category::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Embeddings => "embeddings",
            Category::Attention => "attention",
            Category::Mlp => "mlp",
            Category::Norms => "norms",
            Category::LmHead => "lm_head",
            Category::Other => "other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-category element counts, kept in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Breakdown {
    entries: Vec<(Category, u64)>,
}

impl Breakdown {
    /// Add `count` to `category`, creating the entry at zero first if needed.
    pub fn add(&mut self, category: Category, count: u64) {
        match self.entries.iter_mut().find(|(c, _)| *c == category) {
            Some((_, total)) => *total += count,
            None => self.entries.push((category, count)),
        }
    }

    pub fn get(&self, category: Category) -> Option<u64> {
        self.entries
            .iter()
            .find(|(c, _)| *c == category)
            .map(|(_, n)| *n)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Category, u64)> + '_ {
        self.entries.iter().copied()
    }

    pub fn sum(&self) -> u64 {
        self.entries.iter().map(|(_, n)| n).sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Result of [`count_parameters`].
///
/// `breakdown.sum() + tied == total` always holds; `tied` is non-zero only
/// when an output head shares storage with the embedding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterCount {
    pub total: u64,
    pub breakdown: Breakdown,
    pub tied: u64,
}

impl ParameterCount {
    pub fn into_parts(self) -> (u64, Breakdown) {
        (self.total, self.breakdown)
    }

    /// Render the fixed-width breakdown table.
    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ParameterCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(RULE_WIDTH);
        writeln!(f, "Parameter Breakdown:")?;
        writeln!(f, "{rule}")?;
        for (category, count) in self.breakdown.iter() {
            writeln!(
                f,
                "{:<width$}: {:>12} ({:>5.2}%)",
                category.as_str(),
                group_thousands(count),
                percent_of(count, self.total),
                width = LABEL_WIDTH,
            )?;
        }
        writeln!(f, "{rule}")?;
        writeln!(
            f,
            "{:<width$}: {:>12}",
            "TOTAL",
            group_thousands(self.total),
            width = LABEL_WIDTH,
        )
    }
}

/// Total the model's parameters and bucket them by category.
///
/// A head parameter whose storage matches the embedding contributes zero to
/// the breakdown but still counts toward the total.
pub fn count_parameters<M: ParameterSource>(model: &M) -> ParameterCount {
    let embedding = model.embedding_storage();
    let mut count = ParameterCount::default();

    for param in model.named_parameters() {
        count.total += param.numel;
        let category = Category::classify(&param.name);

        if category == Category::LmHead && embedding == Some(param.storage) {
            debug!(name = %param.name, numel = param.numel, "output head tied to embedding");
            count.breakdown.add(category, 0);
            count.tied += param.numel;
            continue;
        }

        count.breakdown.add(category, param.numel);
    }

    debug!(
        total = count.total,
        categories = count.breakdown.len(),
        tied = count.tied,
        "counted parameters"
    );
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        params: Vec<ParamRecord>,
        embedding: Option<StorageId>,
    }

    impl ParameterSource for Fixture {
        fn named_parameters(&self) -> impl Iterator<Item = ParamRecord> + '_ {
            self.params.iter().cloned()
        }

        fn embedding_storage(&self) -> Option<StorageId> {
            self.embedding
        }
    }

    fn small_model(tied: bool) -> Fixture {
        let head_storage = if tied { StorageId(0) } else { StorageId(4) };
        Fixture {
            params: vec![
                ParamRecord::new("embed.weight", 100, StorageId(0)),
                ParamRecord::new("attn.q.weight", 50, StorageId(1)),
                ParamRecord::new("mlp.fc.weight", 200, StorageId(2)),
                ParamRecord::new("ln.weight", 10, StorageId(3)),
                ParamRecord::new("lm_head.weight", 100, head_storage),
            ],
            embedding: Some(StorageId(0)),
        }
    }

    #[test]
    fn test_classify_priority() {
        assert_eq!(Category::classify("tok_embeddings.weight"), Category::Embeddings);
        assert_eq!(Category::classify("h.0.attn_norm.weight"), Category::Attention);
        assert_eq!(Category::classify("h.0.swiglu.w1"), Category::Mlp);
        assert_eq!(Category::classify("h.0.ln_1.bias"), Category::Norms);
        assert_eq!(Category::classify("final_norm.weight"), Category::Norms);
        assert_eq!(Category::classify("lm_head.weight"), Category::LmHead);
        assert_eq!(Category::classify("pos_bias"), Category::Other);
    }

    #[test]
    fn test_tied_head_counts_zero() {
        let count = count_parameters(&small_model(true));
        assert_eq!(count.total, 460);
        assert_eq!(count.breakdown.get(Category::LmHead), Some(0));
        assert_eq!(count.tied, 100);
        assert_eq!(count.breakdown.sum() + count.tied, count.total);

        let order: Vec<_> = count.breakdown.iter().map(|(c, _)| c).collect();
        assert_eq!(
            order,
            vec![
                Category::Embeddings,
                Category::Attention,
                Category::Mlp,
                Category::Norms,
                Category::LmHead,
            ]
        );
    }

    #[test]
    fn test_untied_head_counts_fully() {
        let (total, breakdown) = count_parameters(&small_model(false)).into_parts();
        assert_eq!(total, 460);
        assert_eq!(breakdown.get(Category::LmHead), Some(100));
        assert_eq!(breakdown.sum(), total);
    }

    #[test]
    fn test_head_without_embedding_is_untied() {
        let mut model = small_model(true);
        model.embedding = None;
        let count = count_parameters(&model);
        assert_eq!(count.breakdown.get(Category::LmHead), Some(100));
        assert_eq!(count.tied, 0);
    }

    #[test]
    fn test_repeated_categories_accumulate() {
        let model = Fixture {
            params: vec![
                ParamRecord::new("blocks.0.attn.qkv", 30, StorageId(1)),
                ParamRecord::new("dropout_scale", 1, StorageId(2)),
                ParamRecord::new("blocks.1.attn.qkv", 30, StorageId(3)),
            ],
            embedding: None,
        };
        let count = count_parameters(&model);
        assert_eq!(count.breakdown.get(Category::Attention), Some(60));
        assert_eq!(count.breakdown.get(Category::Other), Some(1));
        assert_eq!(count.breakdown.len(), 2);
    }

    #[test]
    fn test_empty_model() {
        let model = Fixture {
            params: Vec::new(),
            embedding: None,
        };
        let count = count_parameters(&model);
        assert_eq!(count.total, 0);
        assert!(count.breakdown.is_empty());
        assert!(count.render().contains("TOTAL"));
    }

    #[test]
    fn test_render_layout() {
        let report = count_parameters(&small_model(false)).render();
        let lines: Vec<&str> = report.lines().collect();
        assert_eq!(lines[0], "Parameter Breakdown:");
        assert_eq!(lines[1], "=".repeat(50));
        assert_eq!(lines[2], "embeddings          :          100 (21.74%)");
        assert_eq!(lines[4], "mlp                 :          200 (43.48%)");
        assert_eq!(lines[7], "=".repeat(50));
        assert_eq!(lines[8], "TOTAL               :          460");
    }

    #[test]
    fn test_render_zero_counts_with_zero_total() {
        let model = Fixture {
            params: vec![ParamRecord::new("attn.scale", 0, StorageId(1))],
            embedding: None,
        };
        let report = count_parameters(&model).render();
        assert!(report.contains("attention           :            0 ( 0.00%)"));
    }
}
