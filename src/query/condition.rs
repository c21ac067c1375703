use std::collections::BTreeSet;

use crate::core::FieldValue;

/// 查询谓词树。
#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    /// 匹配全部记录。
    True,
    Equals {
        field: String,
        value: FieldValue,
    },
    /// 闭区间；None 表示该侧不设界。
    Range {
        field: String,
        low: Option<FieldValue>,
        high: Option<FieldValue>,
    },
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    pub fn eq(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Condition::Equals {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn range(
        field: impl Into<String>,
        low: impl Into<FieldValue>,
        high: impl Into<FieldValue>,
    ) -> Self {
        Condition::Range {
            field: field.into(),
            low: Some(low.into()),
            high: Some(high.into()),
        }
    }

    pub fn at_least(field: impl Into<String>, low: impl Into<FieldValue>) -> Self {
        Condition::Range {
            field: field.into(),
            low: Some(low.into()),
            high: None,
        }
    }

    pub fn at_most(field: impl Into<String>, high: impl Into<FieldValue>) -> Self {
        Condition::Range {
            field: field.into(),
            low: None,
            high: Some(high.into()),
        }
    }

    pub fn and(conds: impl IntoIterator<Item = Condition>) -> Self {
        Condition::And(conds.into_iter().collect())
    }

    pub fn or(conds: impl IntoIterator<Item = Condition>) -> Self {
        Condition::Or(conds.into_iter().collect())
    }

    pub fn not(cond: Condition) -> Self {
        Condition::Not(Box::new(cond))
    }

    /// 叶子引用的字段（去重、有序）。
    pub fn fields(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Condition::True => {}
            Condition::Equals { field, .. } | Condition::Range { field, .. } => {
                out.insert(field.as_str());
            }
            Condition::And(cs) | Condition::Or(cs) => {
                for c in cs {
                    c.collect_fields(out);
                }
            }
            Condition::Not(c) => c.collect_fields(out),
        }
    }

    /// 叶子谓词对单个字段值的判定；缺失字段（None）不匹配任何叶子。
    pub fn leaf_matches(&self, value: Option<&FieldValue>) -> bool {
        let Some(v) = value else {
            return false;
        };
        match self {
            Condition::Equals { value, .. } => v == value,
            Condition::Range { low, high, .. } => {
                low.as_ref().map_or(true, |l| v >= l) && high.as_ref().map_or(true, |h| v <= h)
            }
            _ => false,
        }
    }

    /// 对一条记录直接求值；`get` 返回该记录的字段值。
    pub fn matches<F>(&self, get: &mut F) -> bool
    where
        F: FnMut(&str) -> Option<FieldValue>,
    {
        match self {
            Condition::True => true,
            Condition::Equals { field, .. } | Condition::Range { field, .. } => {
                let v = get(field);
                self.leaf_matches(v.as_ref())
            }
            Condition::And(cs) => cs.iter().all(|c| c.matches(get)),
            Condition::Or(cs) => cs.iter().any(|c| c.matches(get)),
            Condition::Not(c) => !c.matches(get),
        }
    }
}
