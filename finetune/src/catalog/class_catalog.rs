use std::collections::HashSet;

use super::{CatalogError, ResourceLister};

/// Hard floor per class; the split and batch-size heuristics assume it.
pub const MIN_SAMPLES_PER_CLASS: usize = 10;
pub const PAGE_SIZE: u32 = 500;

/// A flattened (class index, url) pair. The index is the class's position
/// in the declared class order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleRef {
    pub class_index: usize,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ClassEntry {
    name: String,
    urls: Vec<String>,
}

/// Ordered class name → image URLs mapping for one training run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassCatalog {
    classes: Vec<ClassEntry>,
}

impl ClassCatalog {
    pub fn new(classes: Vec<(String, Vec<String>)>) -> Result<Self, CatalogError> {
        validate_names(classes.iter().map(|(name, _)| name.as_str()))?;
        for (name, urls) in &classes {
            check_minimum(name, urls.len())?;
        }
        Ok(Self {
            classes: classes
                .into_iter()
                .map(|(name, urls)| ClassEntry { name, urls })
                .collect(),
        })
    }

    /// Lists `dataset/{model_name}/{class}` for every class, following the
    /// continuation cursor until the listing is exhausted.
    pub async fn fetch<L: ResourceLister>(
        lister: &L,
        model_name: &str,
        class_names: &[String],
    ) -> Result<Self, CatalogError> {
        validate_names(class_names.iter().map(String::as_str))?;

        let mut classes = Vec::with_capacity(class_names.len());
        for class in class_names {
            log::info!("=== Fetching class: {} ===", class);
            let prefix = format!("dataset/{}/{}", model_name, class);
            let mut urls = Vec::new();
            let mut cursor: Option<String> = None;
            loop {
                let page = lister.list(&prefix, PAGE_SIZE, cursor.as_deref()).await?;
                log::info!("  Fetched {} images", page.resources.len());
                urls.extend(page.resources.into_iter().map(|r| r.secure_url));
                match page.next_cursor {
                    Some(next) if !next.is_empty() => cursor = Some(next),
                    _ => break,
                }
            }
            log::info!("Total images for class '{}': {}", class, urls.len());
            check_minimum(class, urls.len())?;
            classes.push(ClassEntry {
                name: class.clone(),
                urls,
            });
        }
        Ok(Self { classes })
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    pub fn class_names(&self) -> Vec<String> {
        self.classes.iter().map(|c| c.name.clone()).collect()
    }

    pub fn class_counts(&self) -> Vec<usize> {
        self.classes.iter().map(|c| c.urls.len()).collect()
    }

    pub fn total_samples(&self) -> usize {
        self.classes.iter().map(|c| c.urls.len()).sum()
    }

    pub fn samples(&self) -> Vec<SampleRef> {
        self.classes
            .iter()
            .enumerate()
            .flat_map(|(class_index, class)| {
                class.urls.iter().map(move |url| SampleRef {
                    class_index,
                    url: url.clone(),
                })
            })
            .collect()
    }
}

fn validate_names<'a>(names: impl Iterator<Item = &'a str>) -> Result<(), CatalogError> {
    let mut seen = HashSet::new();
    let mut count = 0;
    for name in names {
        count += 1;
        if name.trim().is_empty() {
            return Err(CatalogError::InvalidClassList("empty class name".into()));
        }
        if !seen.insert(name) {
            return Err(CatalogError::InvalidClassList(format!(
                "duplicate class '{}'",
                name
            )));
        }
    }
    if count == 0 {
        return Err(CatalogError::InvalidClassList("no classes given".into()));
    }
    Ok(())
}

fn check_minimum(class: &str, found: usize) -> Result<(), CatalogError> {
    if found < MIN_SAMPLES_PER_CLASS {
        return Err(CatalogError::InsufficientData {
            class: class.to_string(),
            found,
            required: MIN_SAMPLES_PER_CLASS,
        });
    }
    Ok(())
}

/// Parses the class list argument of the training job. Both JSON
/// (`["a", "b"]`) and Python list literals (`['a', 'b']`) are accepted.
pub fn parse_class_list(literal: &str) -> Result<Vec<String>, CatalogError> {
    if let Ok(list) = serde_json::from_str::<Vec<String>>(literal) {
        return Ok(list);
    }

    let invalid = |reason: &str| CatalogError::InvalidClassList(format!("{}: {}", reason, literal));
    let inner = literal
        .trim()
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(|| invalid("expected a bracketed list"))?;

    let mut classes = Vec::new();
    let mut chars = inner.chars().peekable();
    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        let Some(quote) = chars.next() else { break };
        if quote != '\'' && quote != '"' {
            return Err(invalid("expected a quoted class name"));
        }
        let mut name = String::new();
        let mut closed = false;
        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some(escaped) => name.push(escaped),
                    None => return Err(invalid("dangling escape")),
                },
                c if c == quote => {
                    closed = true;
                    break;
                }
                c => name.push(c),
            }
        }
        if !closed {
            return Err(invalid("unterminated string"));
        }
        classes.push(name);

        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        match chars.next() {
            Some(',') | None => {}
            Some(_) => return Err(invalid("expected ',' between class names")),
        }
    }
    Ok(classes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Resource, ResourcePage};
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// Serves pre-built pages keyed by (prefix, cursor) and records calls.
    #[derive(Default)]
    struct FakeLister {
        pages: HashMap<(String, Option<String>), ResourcePage>,
        calls: RefCell<Vec<(String, u32, Option<String>)>>,
    }

    impl FakeLister {
        fn add(&mut self, prefix: &str, cursor: Option<&str>, count: usize, next: Option<&str>) {
            let resources = (0..count)
                .map(|i| Resource {
                    secure_url: format!(
                        "https://res.cloudinary.com/{}/{}-{}.jpg",
                        prefix,
                        cursor.unwrap_or("p0"),
                        i
                    ),
                })
                .collect();
            self.pages.insert(
                (prefix.to_string(), cursor.map(str::to_string)),
                ResourcePage {
                    resources,
                    next_cursor: next.map(str::to_string),
                },
            );
        }
    }

    impl ResourceLister for FakeLister {
        async fn list(
            &self,
            prefix: &str,
            page_size: u32,
            cursor: Option<&str>,
        ) -> Result<ResourcePage, CatalogError> {
            self.calls
                .borrow_mut()
                .push((prefix.to_string(), page_size, cursor.map(str::to_string)));
            Ok(self
                .pages
                .get(&(prefix.to_string(), cursor.map(str::to_string)))
                .cloned()
                .unwrap_or_default())
        }
    }

    fn urls(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("https://cdn/{}.jpg", i)).collect()
    }

    #[tokio::test]
    async fn follows_cursors_and_preserves_order() {
        let mut lister = FakeLister::default();
        lister.add("dataset/pets/cat", None, 6, Some("c1"));
        lister.add("dataset/pets/cat", Some("c1"), 6, None);
        lister.add("dataset/pets/dog", None, 12, None);

        let classes = vec!["cat".to_string(), "dog".to_string()];
        let catalog = ClassCatalog::fetch(&lister, "pets", &classes).await.unwrap();

        assert_eq!(catalog.class_names(), classes);
        assert_eq!(catalog.class_counts(), vec![12, 12]);
        let samples = catalog.samples();
        assert_eq!(samples[0].class_index, 0);
        assert!(samples[0].url.ends_with("p0-0.jpg"));
        assert!(samples[6].url.ends_with("c1-0.jpg"));
        assert_eq!(samples[12].class_index, 1);

        let calls = lister.calls.borrow();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|(_, size, _)| *size == PAGE_SIZE));
        assert_eq!(calls[1].2.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn class_under_minimum_fails_before_training() {
        let mut lister = FakeLister::default();
        lister.add("dataset/pets/cat", None, 15, None);
        lister.add("dataset/pets/dog", None, 9, None);

        let classes = vec!["cat".to_string(), "dog".to_string()];
        let err = ClassCatalog::fetch(&lister, "pets", &classes).await.unwrap_err();
        assert!(matches!(
            err,
            CatalogError::InsufficientData { ref class, found: 9, required: 10 } if class == "dog"
        ));
    }

    #[test]
    fn exactly_ten_is_enough() {
        let catalog = ClassCatalog::new(vec![("a".into(), urls(10)), ("b".into(), urls(11))]).unwrap();
        assert_eq!(catalog.total_samples(), 21);
        assert!(ClassCatalog::new(vec![("a".into(), urls(9))]).is_err());
    }

    #[test]
    fn duplicate_and_empty_class_lists_are_rejected() {
        assert!(matches!(
            ClassCatalog::new(vec![("a".into(), urls(10)), ("a".into(), urls(10))]),
            Err(CatalogError::InvalidClassList(_))
        ));
        assert!(matches!(
            ClassCatalog::new(vec![]),
            Err(CatalogError::InvalidClassList(_))
        ));
    }

    #[test]
    fn parses_json_and_python_literals() {
        assert_eq!(
            parse_class_list(r#"["cats", "dogs"]"#).unwrap(),
            vec!["cats", "dogs"]
        );
        assert_eq!(
            parse_class_list("['cats', 'golden retriever', \"it's\"]").unwrap(),
            vec!["cats", "golden retriever", "it's"]
        );
        assert_eq!(parse_class_list("['a\\'b']").unwrap(), vec!["a'b"]);
        assert_eq!(parse_class_list("[]").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn rejects_malformed_literals() {
        for raw in ["cats, dogs", "[cats]", "['cats' 'dogs']", "['cats"] {
            assert!(parse_class_list(raw).is_err(), "{raw} should fail");
        }
    }
}
