//! WHERE-clause builder with bound parameters.
//!
//! Column names are `&'static str`, so only identifiers written in this
//! crate can reach the SQL text. Every value travels as a parameter.

use crate::bucket::Bucket;
use chrono::NaiveDate;
use rusqlite::types::Value;

#[derive(Debug, Clone, Default)]
pub struct SqlFilter {
    clauses: Vec<String>,
    params:  Vec<Value>,
}

pub(crate) fn date_value(date: NaiveDate) -> Value {
    Value::Text(date.format("%Y-%m-%d").to_string())
}

/// `?, ?, ?` for `n` parameters.
pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

impl SqlFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delinquency bucket pushed down: primary value, else fallback,
    /// inside the bucket's inclusive range. ALL adds nothing.
    pub fn bucket(mut self, bucket: Bucket, primary: &'static str, fallback: &'static str) -> Self {
        if let Some(range) = bucket.range() {
            self.clauses
                .push(format!("COALESCE({primary}, {fallback}) BETWEEN ? AND ?"));
            self.params.push(Value::Integer(*range.start()));
            self.params.push(Value::Integer(*range.end()));
        }
        self
    }

    pub fn date_range(
        mut self,
        column: &'static str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Self {
        if let Some(s) = start {
            self.clauses.push(format!("{column} >= ?"));
            self.params.push(date_value(s));
        }
        if let Some(e) = end {
            self.clauses.push(format!("{column} <= ?"));
            self.params.push(date_value(e));
        }
        self
    }

    pub fn text_eq(mut self, column: &'static str, value: &str) -> Self {
        self.clauses.push(format!("{column} = ?"));
        self.params.push(Value::Text(value.to_string()));
        self
    }

    /// `column IN (...)`. An empty list matches nothing.
    pub fn text_in(mut self, column: &'static str, values: &[String]) -> Self {
        if values.is_empty() {
            self.clauses.push("0 = 1".to_string());
        } else {
            self.clauses
                .push(format!("{column} IN ({})", placeholders(values.len())));
            self.params
                .extend(values.iter().map(|v| Value::Text(v.clone())));
        }
        self
    }

    pub fn positive(mut self, column: &'static str) -> Self {
        self.clauses.push(format!("{column} > 0"));
        self
    }

    /// Collector ids `NULL`, `''` and `'0'` all mean "no collector".
    pub fn collector_present(mut self, column: &'static str) -> Self {
        self.clauses.push(collector_present_sql(column));
        self
    }

    pub fn where_sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// Parameters for a statement whose SELECT list binds `leading`
    /// before this filter's WHERE clause.
    pub fn bind_after(&self, leading: Vec<Value>) -> Vec<Value> {
        let mut all = leading;
        all.extend(self.params.iter().cloned());
        all
    }
}

pub(crate) fn collector_present_sql(column: &'static str) -> String {
    format!("({column} IS NOT NULL AND {column} <> '' AND {column} <> '0')")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_bucket_adds_no_clause() {
        let f = SqlFilter::new().bucket(Bucket::All, "delinquency_days", "legacy_delinquency_days");
        assert_eq!(f.where_sql(), "");
        assert!(f.params().is_empty());
    }

    #[test]
    fn clauses_and_params_stay_in_order() {
        let start = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let f = SqlFilter::new()
            .bucket(Bucket::B2, "delinquency_days", "legacy_delinquency_days")
            .date_range("event_date", Some(start), None)
            .text_in("collector_id", &["a".to_string(), "b".to_string()]);
        assert_eq!(
            f.where_sql(),
            " WHERE COALESCE(delinquency_days, legacy_delinquency_days) BETWEEN ? AND ? \
             AND event_date >= ? AND collector_id IN (?, ?)"
        );
        assert_eq!(
            f.params(),
            &[
                Value::Integer(91),
                Value::Integer(180),
                Value::Text("2025-01-01".to_string()),
                Value::Text("a".to_string()),
                Value::Text("b".to_string()),
            ]
        );
    }

    #[test]
    fn empty_in_list_matches_nothing() {
        let f = SqlFilter::new().text_in("collector_id", &[]);
        assert_eq!(f.where_sql(), " WHERE 0 = 1");
    }
}
