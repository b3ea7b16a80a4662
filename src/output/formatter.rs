use std::collections::HashMap;

/// Renders fetched rows for the dump file.
pub trait RowFormatter {
    fn header(&self) -> String;
    fn row(&self, row: &HashMap<String, String>) -> String;
    fn footer(&self) -> String;
}

/// Tab-separated values: one header line with the column names, one line per
/// row in the same column order, no footer.
pub struct TsvFormatter {
    columns: Vec<String>,
}

impl TsvFormatter {
    pub fn new(columns: Vec<String>) -> Self {
        Self { columns }
    }
}

impl RowFormatter for TsvFormatter {
    fn header(&self) -> String {
        self.columns.join("\t")
    }

    fn row(&self, row: &HashMap<String, String>) -> String {
        self.columns
            .iter()
            .map(|column| row.get(column).map(String::as_str).unwrap_or(""))
            .collect::<Vec<_>>()
            .join("\t")
    }

    fn footer(&self) -> String {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn formatter() -> TsvFormatter {
        TsvFormatter::new(vec!["first_name".to_string(), "last_name".to_string()])
    }

    #[test]
    fn header_joins_column_names() {
        assert_eq!(formatter().header(), "first_name\tlast_name");
    }

    #[test]
    fn row_preserves_column_order() {
        let row = HashMap::from([
            ("last_name".to_string(), "Brown".to_string()),
            ("first_name".to_string(), "Gordon".to_string()),
        ]);
        assert_eq!(formatter().row(&row), "Gordon\tBrown");
    }

    #[test]
    fn missing_columns_render_empty() {
        let row = HashMap::from([("first_name".to_string(), "Gordon".to_string())]);
        assert_eq!(formatter().row(&row), "Gordon\t");
    }

    #[test]
    fn footer_is_empty() {
        assert_eq!(formatter().footer(), "");
    }
}
