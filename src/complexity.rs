//! Operation cost estimation and admission
//!
//! Before any resolution work starts, the gate estimates the cost of the
//! requested operation and rejects it when the cost exceeds the caller
//! role's ceiling. The estimate is compositional: every requested field
//! carries a base cost, a list field multiplies its own cost and that of
//! its children by the bounded page size, and search/filter/sort arguments
//! add surcharges.
//! Depth contributes super-linearly (an exponential weight per nesting
//! level, capped) so deeply nested relationship queries cannot amplify
//! upstream load cheaply.
//!
//! The check is a pure pre-check. It reads only the operation shape and the
//! caller role; it never touches loaders or the cache.

use crate::metrics::Metrics;
use crate::types::{OperationKind, Rejection, Role};
use std::sync::Arc;

/// Structural description of one requested field, supplied by the resolver
/// layer after parsing. Payload shape is irrelevant here; only the parts
/// that drive cost are captured.
#[derive(Clone, Debug, Default)]
pub struct FieldSpec {
    pub name: String,
    /// Requested page size. `Some` marks the field as list-producing.
    pub page_size: Option<u64>,
    /// Free-text search term present in the arguments
    pub has_search: bool,
    pub filter_count: u64,
    pub sort_count: u64,
    /// Nested relationship selections
    pub children: Vec<FieldSpec>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn with_search(mut self) -> Self {
        self.has_search = true;
        self
    }

    pub fn with_filters(mut self, count: u64) -> Self {
        self.filter_count = count;
        self
    }

    pub fn with_sorts(mut self, count: u64) -> Self {
        self.sort_count = count;
        self
    }

    pub fn with_child(mut self, child: FieldSpec) -> Self {
        self.children.push(child);
        self
    }
}

/// The shape of one incoming operation.
#[derive(Clone, Debug)]
pub struct OperationShape {
    pub kind: OperationKind,
    pub name: Option<String>,
    pub fields: Vec<FieldSpec>,
}

impl OperationShape {
    pub fn query(fields: Vec<FieldSpec>) -> Self {
        Self {
            kind: OperationKind::Query,
            name: None,
            fields,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Per-role cost ceilings.
///
/// The ordering `admin >= staff >= patient >= anonymous` is assumed by the
/// rest of the gateway; [`RoleCeilings::validated`] rejects configurations
/// that break it.
#[derive(Clone, Debug)]
pub struct RoleCeilings {
    pub admin: u64,
    pub staff: u64,
    pub patient: u64,
    pub anonymous: u64,
}

impl Default for RoleCeilings {
    fn default() -> Self {
        Self {
            admin: 5_000,
            staff: 3_000,
            patient: 1_500,
            anonymous: 500,
        }
    }
}

impl RoleCeilings {
    pub fn ceiling(&self, role: Role) -> u64 {
        match role {
            Role::Admin => self.admin,
            Role::Staff => self.staff,
            Role::Patient => self.patient,
            Role::Anonymous => self.anonymous,
        }
    }

    pub fn validated(self) -> crate::Result<Self> {
        if self.admin >= self.staff && self.staff >= self.patient && self.patient >= self.anonymous
        {
            Ok(self)
        } else {
            Err(crate::Error::Internal(
                "role ceilings must be non-increasing from admin to anonymous".to_string(),
            ))
        }
    }
}

/// Configuration for the complexity gate
#[derive(Clone, Debug)]
pub struct ComplexityConfig {
    /// Cost of any requested field before surcharges
    pub base_field_cost: u64,
    /// Upper bound applied to requested page sizes before they multiply
    pub page_size_cap: u64,
    /// Surcharge for a free-text search argument
    pub search_cost: u64,
    /// Surcharge per filter condition
    pub filter_cost: u64,
    /// Surcharge per sort specification
    pub sort_cost: u64,
    /// Exponential weight applied per nesting level
    pub depth_factor: f64,
    /// Depth beyond this level stops increasing the weight
    pub depth_cap: u32,
    pub ceilings: RoleCeilings,
    /// Fraction of the ceiling at which an allowed operation is logged
    pub warn_fraction: f64,
}

impl Default for ComplexityConfig {
    fn default() -> Self {
        Self {
            base_field_cost: 1,
            page_size_cap: 100,
            search_cost: 5,
            filter_cost: 2,
            sort_cost: 2,
            depth_factor: 1.5,
            depth_cap: 8,
            ceilings: RoleCeilings::default(),
            warn_fraction: 0.8,
        }
    }
}

impl ComplexityConfig {
    pub fn with_ceilings(mut self, ceilings: RoleCeilings) -> Self {
        self.ceilings = ceilings;
        self
    }
}

/// Outcome of an admitted budget check.
#[derive(Clone, Debug)]
pub struct BudgetCheck {
    pub cost: u64,
    pub ceiling: u64,
    pub remaining: u64,
}

/// Admission gate that prices operations before they run.
pub struct ComplexityGate {
    config: ComplexityConfig,
    metrics: Arc<Metrics>,
}

impl ComplexityGate {
    pub fn new(config: ComplexityConfig, metrics: Arc<Metrics>) -> Self {
        Self { config, metrics }
    }

    /// Estimate the cost of an operation from its shape.
    pub fn estimate(&self, operation: &OperationShape) -> u64 {
        let cost: f64 = operation
            .fields
            .iter()
            .map(|field| self.field_cost(field, 0))
            .sum();
        cost.ceil() as u64
    }

    fn field_cost(&self, field: &FieldSpec, depth: u32) -> f64 {
        let config = &self.config;
        let own = config.base_field_cost
            + if field.has_search { config.search_cost } else { 0 }
            + field.filter_count * config.filter_cost
            + field.sort_count * config.sort_cost;

        let depth_weight = config.depth_factor.powi(depth.min(config.depth_cap) as i32);

        let children: f64 = field
            .children
            .iter()
            .map(|child| self.field_cost(child, depth + 1))
            .sum();

        // A list field produces page_size items, each paying the field's
        // own cost and resolving every child once. Fields without an
        // explicit page size are scalar.
        let fan_out = match field.page_size {
            Some(requested) => requested.min(config.page_size_cap).max(1) as f64,
            None => 1.0,
        };

        fan_out * (own as f64 * depth_weight + children)
    }

    /// Check an already-estimated cost against the role's ceiling.
    ///
    /// A cost exactly at the ceiling is allowed. Rejections carry both the
    /// cost and the ceiling so the caller can simplify its request.
    pub fn check_budget(&self, cost: u64, role: Role) -> std::result::Result<BudgetCheck, Rejection> {
        let ceiling = self.config.ceilings.ceiling(role);
        self.metrics.record_operation_cost(cost);

        if cost > ceiling {
            tracing::info!(cost, ceiling, role = role.as_str(), "operation rejected over budget");
            self.metrics.record_admission("complexity", "rejected");
            return Err(Rejection::over_budget(
                format!("operation cost {cost} exceeds the {} ceiling {ceiling}", role.as_str()),
                cost,
                ceiling,
            ));
        }

        if cost as f64 >= self.config.warn_fraction * ceiling as f64 {
            tracing::warn!(
                cost,
                ceiling,
                role = role.as_str(),
                "operation admitted near the cost ceiling"
            );
        }

        self.metrics.record_admission("complexity", "allowed");
        Ok(BudgetCheck {
            cost,
            ceiling,
            remaining: ceiling - cost,
        })
    }

    /// Estimate and check in one step.
    pub fn admit(
        &self,
        operation: &OperationShape,
        role: Role,
    ) -> std::result::Result<BudgetCheck, Rejection> {
        self.check_budget(self.estimate(operation), role)
    }
}

impl std::fmt::Debug for ComplexityGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComplexityGate")
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> ComplexityGate {
        ComplexityGate::new(ComplexityConfig::default(), Arc::new(Metrics::new().unwrap()))
    }

    fn doctor_list(page_size: u64, depth: u32) -> FieldSpec {
        let mut field = FieldSpec::new("doctors").with_page_size(page_size);
        let mut cursor = &mut field;
        for _ in 0..depth {
            cursor.children.push(FieldSpec::new("appointments").with_page_size(page_size));
            cursor = cursor
                .children
                .last_mut()
                .expect("child was just pushed");
        }
        field
    }

    #[test]
    fn test_larger_pages_cost_strictly_more() {
        let gate = gate();
        let small = gate.estimate(&OperationShape::query(vec![doctor_list(10, 1)]));
        let large = gate.estimate(&OperationShape::query(vec![doctor_list(100, 1)]));
        assert!(large > small, "page 100 ({large}) must exceed page 10 ({small})");
    }

    #[test]
    fn test_leaf_list_page_size_drives_cost() {
        // A flat list with no nested selections still pays per item
        let gate = gate();
        let small =
            gate.estimate(&OperationShape::query(vec![FieldSpec::new("doctors").with_page_size(10)]));
        let large =
            gate.estimate(&OperationShape::query(vec![FieldSpec::new("doctors").with_page_size(100)]));
        assert!(
            large > small,
            "limit=100 ({large}) must cost strictly more than limit=10 ({small})"
        );
        assert_eq!(large, 100);
    }

    #[test]
    fn test_fan_out_requires_explicit_page_size() {
        // List-ness comes from page_size alone, never from the field name
        let gate = gate();
        let child = FieldSpec::new("appointments").with_page_size(10);
        let plural_scalar = gate.estimate(&OperationShape::query(vec![
            FieldSpec::new("status").with_child(child.clone()),
        ]));
        let singular_scalar = gate.estimate(&OperationShape::query(vec![
            FieldSpec::new("profile").with_child(child),
        ]));
        assert_eq!(plural_scalar, singular_scalar);
    }

    #[test]
    fn test_depth_grows_super_linearly() {
        let gate = gate();
        let one = gate.estimate(&OperationShape::query(vec![doctor_list(10, 1)]));
        let three = gate.estimate(&OperationShape::query(vec![doctor_list(10, 3)]));
        // More than a constant factor per extra level
        assert!(three > one * 3, "depth 3 ({three}) must exceed 3x depth 1 ({one})");
    }

    #[test]
    fn test_page_size_is_capped() {
        let gate = gate();
        let at_cap = gate.estimate(&OperationShape::query(vec![doctor_list(100, 1)]));
        let over_cap = gate.estimate(&OperationShape::query(vec![doctor_list(100_000, 1)]));
        assert_eq!(at_cap, over_cap);
    }

    #[test]
    fn test_search_filters_and_sorts_add_cost() {
        let gate = gate();
        let plain = gate.estimate(&OperationShape::query(vec![FieldSpec::new("patients")
            .with_page_size(20)]));
        let decorated = gate.estimate(&OperationShape::query(vec![FieldSpec::new("patients")
            .with_page_size(20)
            .with_search()
            .with_filters(3)
            .with_sorts(2)]));
        assert!(decorated > plain);
    }

    #[test]
    fn test_rejection_reports_cost_and_ceiling() {
        let gate = gate();
        let rejection = gate
            .check_budget(501, Role::Anonymous)
            .expect_err("501 exceeds the anonymous ceiling of 500");
        assert_eq!(rejection.cost, Some(501));
        assert_eq!(rejection.ceiling, Some(500));
        assert!(rejection.retry_after_seconds.is_none());
    }

    #[test]
    fn test_exact_ceiling_is_allowed() {
        let gate = gate();
        let check = gate.check_budget(500, Role::Anonymous).expect("at the ceiling");
        assert_eq!(check.remaining, 0);
    }

    #[test]
    fn test_ceilings_follow_role_order() {
        let ceilings = RoleCeilings::default();
        assert!(ceilings.ceiling(Role::Admin) >= ceilings.ceiling(Role::Staff));
        assert!(ceilings.ceiling(Role::Staff) >= ceilings.ceiling(Role::Patient));
        assert!(ceilings.ceiling(Role::Patient) >= ceilings.ceiling(Role::Anonymous));

        let gate = gate();
        let shape = OperationShape::query(vec![doctor_list(10, 2)]);
        let cost = gate.estimate(&shape);
        assert!(cost > ceilings.ceiling(Role::Anonymous));
        assert!(cost <= ceilings.ceiling(Role::Admin));
        assert!(gate.check_budget(cost, Role::Admin).is_ok());
        assert!(gate.check_budget(cost, Role::Anonymous).is_err());
    }

    #[test]
    fn test_invalid_ceiling_order_is_rejected() {
        let bad = RoleCeilings {
            admin: 100,
            staff: 200,
            patient: 50,
            anonymous: 10,
        };
        assert!(bad.validated().is_err());
        assert!(RoleCeilings::default().validated().is_ok());
    }

    #[test]
    fn test_estimate_has_no_side_effects_on_shape() {
        let gate = gate();
        let shape = OperationShape::query(vec![doctor_list(10, 2)]).named("GetDoctors");
        let first = gate.estimate(&shape);
        let second = gate.estimate(&shape);
        assert_eq!(first, second);
    }
}
