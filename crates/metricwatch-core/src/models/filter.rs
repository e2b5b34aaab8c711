//! Dimension filters applied to metric documents

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Filter operator on a dimension value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    /// Dimension equals the value
    Eq,
    /// Dimension is absent or differs from the value
    Ne,
    /// Dimension is present
    Exists,
    /// Dimension is absent
    NotExists,
    /// Dimension equals one of the values
    In,
}

/// A single condition on a document dimension. Filters in a list are ANDed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionFilter {
    pub field: String,
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: serde_json::Value,
}

impl DimensionFilter {
    /// Check that the value has the shape the operator needs
    pub fn validate(&self) -> Result<()> {
        if self.field.trim().is_empty() {
            return Err(Error::validation("filter field must not be empty"));
        }
        match self.operator {
            FilterOperator::Eq | FilterOperator::Ne => {
                if scalar_text(&self.value).is_none() {
                    return Err(Error::validation(format!(
                        "filter on '{}': {:?} needs a string, number or boolean value",
                        self.field, self.operator
                    )));
                }
            }
            FilterOperator::In => {
                let valid = self
                    .value
                    .as_array()
                    .map(|values| values.iter().all(|v| scalar_text(v).is_some()))
                    .unwrap_or(false);
                if !valid {
                    return Err(Error::validation(format!(
                        "filter on '{}': in needs an array of scalar values",
                        self.field
                    )));
                }
            }
            FilterOperator::Exists | FilterOperator::NotExists => {}
        }
        Ok(())
    }

    /// Values to compare against, rendered as dimension text
    pub fn values(&self) -> Vec<String> {
        match &self.value {
            serde_json::Value::Array(values) => values.iter().filter_map(scalar_text).collect(),
            other => scalar_text(other).into_iter().collect(),
        }
    }
}

/// Render a scalar JSON value the way it is stored as dimension text
pub fn scalar_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Parse a rule-level filter query: a JSON array of filters, a single filter
/// object, or a blank string for no filter.
pub fn parse_filter_query(query: &str) -> Result<Vec<DimensionFilter>> {
    let query = query.trim();
    if query.is_empty() {
        return Ok(Vec::new());
    }

    let value: serde_json::Value = serde_json::from_str(query)
        .map_err(|e| Error::validation(format!("filter query is not valid JSON: {e}")))?;

    let filters: Vec<DimensionFilter> = if value.is_array() {
        serde_json::from_value(value)
    } else {
        serde_json::from_value(value).map(|f| vec![f])
    }
    .map_err(|e| Error::validation(format!("invalid filter query: {e}")))?;

    for filter in &filters {
        filter.validate()?;
    }

    Ok(filters)
}
