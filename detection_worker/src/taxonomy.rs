use std::{
    fs::File,
    io::{self, BufRead},
    path::Path,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaxonomyError {
    #[error("failed to read labels file: {0}")]
    Io(#[from] io::Error),
    #[error("empty class name on line {0}")]
    EmptyName(usize),
    #[error("labels file contains no classes")]
    Empty,
    #[error("model emits {model} classes but the taxonomy has {taxonomy}")]
    CardinalityMismatch { model: usize, taxonomy: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Taxonomy {
    class_names: Vec<String>,
}

impl Taxonomy {
    pub fn new(class_names: Vec<String>) -> Result<Self, TaxonomyError> {
        if class_names.is_empty() {
            return Err(TaxonomyError::Empty);
        }
        if let Some(position) = class_names.iter().position(|name| name.is_empty()) {
            return Err(TaxonomyError::EmptyName(position + 1));
        }
        Ok(Self { class_names })
    }

    pub fn load(filepath: &Path) -> Result<Self, TaxonomyError> {
        let file = File::open(filepath)?;
        Self::from_reader(io::BufReader::new(file))
    }

    pub fn from_reader(reader: impl BufRead) -> Result<Self, TaxonomyError> {
        let mut class_names = Vec::new();

        for (line_number, line_result) in reader.lines().enumerate() {
            let line = line_result?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let name = line.split(',').next().unwrap_or_default().trim();
            if name.is_empty() {
                return Err(TaxonomyError::EmptyName(line_number + 1));
            }
            class_names.push(name.to_string());
        }

        Self::new(class_names)
    }

    pub fn name(&self, class_index: usize) -> Option<&str> {
        self.class_names.get(class_index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.class_names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.class_names.is_empty()
    }

    pub fn validate_against(&self, model_classes: Option<usize>) -> Result<(), TaxonomyError> {
        match model_classes {
            Some(model) if model != self.len() => Err(TaxonomyError::CardinalityMismatch {
                model,
                taxonomy: self.len(),
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_from_reader_skips_comments_and_colours() {
        let labels = "# coco subset\nperson, 255, 0, 0\n\nbicycle\ncar,0,0,255\n";

        let taxonomy = Taxonomy::from_reader(Cursor::new(labels)).unwrap();

        assert_eq!(taxonomy.len(), 3);
        assert_eq!(taxonomy.name(0), Some("person"));
        assert_eq!(taxonomy.name(1), Some("bicycle"));
        assert_eq!(taxonomy.name(2), Some("car"));
        assert_eq!(taxonomy.name(3), None);
    }

    #[test]
    fn test_from_reader_rejects_bad_files() {
        assert!(matches!(
            Taxonomy::from_reader(Cursor::new("# nothing here\n")),
            Err(TaxonomyError::Empty)
        ));
        assert!(matches!(
            Taxonomy::from_reader(Cursor::new("person\n, 1, 2, 3\n")),
            Err(TaxonomyError::EmptyName(2))
        ));
    }

    #[test]
    fn test_validate_against_model_cardinality() {
        let taxonomy = Taxonomy::new(vec!["cat".to_string(), "dog".to_string()]).unwrap();

        assert!(taxonomy.validate_against(Some(2)).is_ok());
        assert!(taxonomy.validate_against(None).is_ok());
        assert!(matches!(
            taxonomy.validate_against(Some(80)),
            Err(TaxonomyError::CardinalityMismatch {
                model: 80,
                taxonomy: 2
            })
        ));
    }

    #[test]
    fn test_shipped_coco_labels() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("labels/coco.txt");

        let taxonomy = Taxonomy::load(&path).unwrap();

        assert_eq!(taxonomy.len(), 80);
        assert_eq!(taxonomy.name(0), Some("person"));
        assert_eq!(taxonomy.name(79), Some("toothbrush"));
    }
}
