use crate::matrix::ExpressionMatrix;
use ahash::AHashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LabelError {
    #[error("The category allow-list is empty.")]
    EmptyCategorySet,
    #[error("Category '{0}' appears more than once in the allow-list.")]
    DuplicateCategory(String),
    #[error("Category names must not be empty.")]
    BlankCategory,
}

/// Resolution of one sample's label against the allow-list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Category {
    /// Position of the label in the owning `CategorySet`.
    Known(usize),
    /// The sample has no label, or its label is not in the allow-list.
    Unassigned,
}

impl Category {
    pub fn index(self) -> Option<usize> {
        match self {
            Self::Known(k) => Some(k),
            Self::Unassigned => None,
        }
    }
}

/// An ordered, closed set of allowed category names. The order fixes the column order of
/// reference matrices and the row order of quantity matrices.
#[derive(Clone, Debug)]
pub struct CategorySet {
    names: Vec<String>,
    index: AHashMap<String, usize>,
}

impl CategorySet {
    pub fn new<I, S>(names: I) -> Result<Self, LabelError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            return Err(LabelError::EmptyCategorySet);
        }
        let mut index = AHashMap::with_capacity(names.len());
        for (k, name) in names.iter().enumerate() {
            if name.is_empty() {
                return Err(LabelError::BlankCategory);
            }
            if index.insert(name.clone(), k).is_some() {
                return Err(LabelError::DuplicateCategory(name.clone()));
            }
        }
        Ok(Self { names, index })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn name(&self, k: usize) -> Option<&str> {
        self.names.get(k).map(String::as_str)
    }

    pub fn classify(&self, label: &str) -> Category {
        match self.index.get(label) {
            Some(&k) => Category::Known(k),
            None => Category::Unassigned,
        }
    }
}

/// Sample identifier to category label, as supplied by external preprocessing.
#[derive(Clone, Debug, Default)]
pub struct LabelMap {
    labels: AHashMap<String, String>,
}

impl LabelMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, sample_id: impl Into<String>, label: impl Into<String>) {
        self.labels.insert(sample_id.into(), label.into());
    }

    pub fn label_of(&self, sample_id: &str) -> Option<&str> {
        self.labels.get(sample_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Resolves every column of `matrix` against `categories`, in column order.
    pub fn assign(&self, matrix: &ExpressionMatrix, categories: &CategorySet) -> Vec<Category> {
        let assignments: Vec<Category> = matrix
            .sample_ids()
            .iter()
            .map(|id| match self.label_of(id) {
                Some(label) => categories.classify(label),
                None => Category::Unassigned,
            })
            .collect();
        let unassigned = assignments
            .iter()
            .filter(|c| **c == Category::Unassigned)
            .count();
        if unassigned > 0 {
            log::debug!(
                "{} of {} samples carry no allowed category label and will be ignored",
                unassigned,
                assignments.len()
            );
        }
        assignments
    }
}

impl<K, V> FromIterator<(K, V)> for LabelMap
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut map = Self::new();
        for (sample, label) in iter {
            map.insert(sample, label);
        }
        map
    }
}

/// Column indices grouped by category, in category order.
pub(crate) fn members_by_category(assignments: &[Category], n_categories: usize) -> Vec<Vec<usize>> {
    let mut members = vec![Vec::new(); n_categories];
    for (j, category) in assignments.iter().enumerate() {
        if let Category::Known(k) = *category {
            members[k].push(j);
        }
    }
    members
}
