//! Validation of canonical queries against the live schema, plus the small
//! set of known field-confusion repairs.

use crate::ast::{CanonicalQuery, Clause, SimpleFilter};
use crate::error::{StoreError, ValidationError};
use crate::schema::{FieldSet, SchemaIntrospector};
use std::sync::Arc;
use tracing::{info, warn};

/// Which reading of the query text triggers a rewrite.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Intent {
    SellingPrice,
    InternalCost,
}

struct FieldConfusion {
    entity_type: &'static str,
    used: &'static str,
    corrected: &'static str,
    when: Intent,
}

static CONFUSIONS: &[FieldConfusion] = &[
    FieldConfusion {
        entity_type: "product",
        used: "standard_price",
        corrected: "list_price",
        when: Intent::SellingPrice,
    },
    FieldConfusion {
        entity_type: "product",
        used: "list_price",
        corrected: "standard_price",
        when: Intent::InternalCost,
    },
];

/// Fields that live on a different entity type than the one searched.
static RELOCATED: &[(&str, &str, &str)] = &[
    ("product_variant", "list_price", "product"),
    ("product_variant", "standard_price", "product"),
];

const PRICE_KEYWORDS: &[&str] = &[
    "price", "prezzo", "euro", "€", "under", "sopra", "above", "below", "less", "more", "cheaper",
    "expensive",
];

const COST_KEYWORDS: &[&str] = &["internal cost", "costo interno", "cost price", "our cost", "nostro costo"];

fn detect_intent(query_text: &str) -> Option<Intent> {
    let lower = query_text.to_lowercase();
    if COST_KEYWORDS.iter().any(|k| lower.contains(k)) {
        Some(Intent::InternalCost)
    } else if PRICE_KEYWORDS.iter().any(|k| lower.contains(k)) {
        Some(Intent::SellingPrice)
    } else {
        None
    }
}

fn fields(schema: &SchemaIntrospector<'_>, entity_type: &str) -> Result<Arc<FieldSet>, ValidationError> {
    schema.fields_of(entity_type).map_err(|err| match err {
        StoreError::UnknownEntity(name) => ValidationError::UnknownEntity(name),
        other => ValidationError::UnknownEntity(format!("{} ({})", entity_type, other)),
    })
}

/// Validate a canonical query, rewriting known field confusions in simple filters.
pub fn validate(
    query: CanonicalQuery,
    entity_type: &str,
    query_text: &str,
    schema: &SchemaIntrospector<'_>,
) -> Result<CanonicalQuery, ValidationError> {
    match &query {
        CanonicalQuery::CountAggregate(agg) => {
            validate_link(&agg.primary_model, &agg.secondary_model, &agg.link_field, schema)?
        }
        CanonicalQuery::Exclusion(ex) => {
            validate_link(&ex.primary_model, &ex.secondary_model, &ex.link_field, schema)?
        }
        // statement safety is checked where the statement is produced
        CanonicalQuery::SimpleFilter(_) | CanonicalQuery::RawQuery(_) => {}
    }

    match query {
        CanonicalQuery::SimpleFilter(filter) => Ok(CanonicalQuery::SimpleFilter(validate_and_fix(
            filter,
            entity_type,
            query_text,
            schema,
        )?)),
        other => Ok(other),
    }
}

pub fn validate_and_fix(
    mut filter: SimpleFilter,
    entity_type: &str,
    query_text: &str,
    schema: &SchemaIntrospector<'_>,
) -> Result<SimpleFilter, ValidationError> {
    let field_set = fields(schema, entity_type)?;
    let intent = detect_intent(query_text);

    for clause in filter.clauses_mut() {
        if let Some(intent) = intent {
            correct_confusion(clause, entity_type, intent, &field_set);
        }
        check_clause(clause, entity_type, &field_set, schema)?;
    }
    Ok(filter)
}

fn correct_confusion(clause: &mut Clause, entity_type: &str, intent: Intent, field_set: &FieldSet) {
    let rule = CONFUSIONS.iter().find(|rule| {
        rule.entity_type == entity_type && rule.used == clause.field && rule.when == intent
    });
    if let Some(rule) = rule {
        if field_set.is_persisted(rule.corrected) {
            info!(
                from = rule.used,
                to = rule.corrected,
                entity_type,
                "corrected field from query intent"
            );
            clause.field = rule.corrected.to_string();
        }
    }
}

fn check_clause(
    clause: &Clause,
    entity_type: &str,
    field_set: &FieldSet,
    schema: &SchemaIntrospector<'_>,
) -> Result<(), ValidationError> {
    check_path(&clause.field, entity_type, field_set, schema)
}

fn check_path(
    path: &str,
    entity_type: &str,
    field_set: &FieldSet,
    schema: &SchemaIntrospector<'_>,
) -> Result<(), ValidationError> {
    let (base, tail) = match path.split_once('.') {
        Some((base, tail)) => (base, Some(tail)),
        None => (path, None),
    };

    let Some(descriptor) = field_set.get(base) else {
        if let Some((_, _, alternate)) = RELOCATED
            .iter()
            .find(|(entity, field, _)| *entity == entity_type && *field == base)
        {
            if schema.store().has_entity(alternate) {
                return Err(ValidationError::FieldOnOtherEntity {
                    field: base.to_string(),
                    entity_type: entity_type.to_string(),
                    alternate_entity: alternate.to_string(),
                });
            }
        }
        warn!(field = base, entity_type, "unknown field in filter");
        return Err(ValidationError::UnknownField {
            field: base.to_string(),
            entity_type: entity_type.to_string(),
            valid_fields: field_set.suggestions(),
        });
    };

    if !descriptor.persisted {
        return Err(ValidationError::ComputedFieldNotQueryable {
            field: base.to_string(),
            entity_type: entity_type.to_string(),
            valid_fields: field_set.suggestions(),
        });
    }

    match (tail, &descriptor.relation) {
        (None, _) => Ok(()),
        (Some(tail), Some(target)) => {
            let target_fields = fields(schema, target)?;
            check_path(tail, target, &target_fields, schema)
        }
        (Some(_), None) => Err(ValidationError::UnknownField {
            field: path.to_string(),
            entity_type: entity_type.to_string(),
            valid_fields: field_set.suggestions(),
        }),
    }
}

/// Both entity types exist and `secondary.link_field` is a stored link to `primary`.
fn validate_link(
    primary: &str,
    secondary: &str,
    link_field: &str,
    schema: &SchemaIntrospector<'_>,
) -> Result<(), ValidationError> {
    fields(schema, primary)?;
    let secondary_fields = fields(schema, secondary)?;

    let Some(link) = secondary_fields.get(link_field) else {
        return Err(ValidationError::UnknownField {
            field: link_field.to_string(),
            entity_type: secondary.to_string(),
            valid_fields: secondary_fields.suggestions(),
        });
    };
    if !link.persisted {
        return Err(ValidationError::ComputedFieldNotQueryable {
            field: link_field.to_string(),
            entity_type: secondary.to_string(),
            valid_fields: secondary_fields.suggestions(),
        });
    }
    if link.relation.as_deref() != Some(primary) {
        return Err(ValidationError::LinkTargetMismatch {
            link_field: link_field.to_string(),
            secondary: secondary.to_string(),
            expected: primary.to_string(),
            actual: link.relation.clone().unwrap_or_else(|| "nothing".to_string()),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{CountAggregate, CountComparison, Exclusion, FilterOp, FilterTerm, Literal};
    use crate::schema::{EntitySchema, FieldDescriptor, FieldType};
    use crate::store::SqliteStore;
    use proptest::prelude::*;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory(vec![
            EntitySchema::new("product", "products")
                .field(FieldDescriptor::new("name", FieldType::Char, "Name"))
                .field(FieldDescriptor::new("list_price", FieldType::Monetary, "Sales Price"))
                .field(FieldDescriptor::new("standard_price", FieldType::Monetary, "Cost"))
                .field(FieldDescriptor::new("qty_available", FieldType::Float, "On Hand").computed())
                .field(FieldDescriptor::link("categ_ref", "category", "Category")),
            EntitySchema::new("category", "categories")
                .field(FieldDescriptor::new("name", FieldType::Char, "Name")),
            EntitySchema::new("product_variant", "product_variants")
                .field(FieldDescriptor::new("barcode", FieldType::Char, "Barcode"))
                .field(FieldDescriptor::link("product_ref", "product", "Product")),
            EntitySchema::new("order_line", "order_lines")
                .field(FieldDescriptor::link("product_ref", "product", "Product"))
                .field(FieldDescriptor::link("categ_ref", "category", "Category")),
        ])
        .unwrap()
    }

    fn filter(field: &str) -> SimpleFilter {
        SimpleFilter::new(vec![FilterTerm::Clause(Clause::new(field, FilterOp::Lt, Literal::Integer(100)))])
    }

    fn first_field(filter: &SimpleFilter) -> &str {
        &filter.clauses().next().unwrap().field
    }

    #[test]
    fn test_price_confusion_corrected() {
        let store = store();
        let schema = SchemaIntrospector::new(&store);
        let fixed = validate_and_fix(filter("standard_price"), "product", "products under 100 euro", &schema).unwrap();
        assert_eq!(first_field(&fixed), "list_price");
    }

    #[test]
    fn test_cost_intent_keeps_or_restores_cost_field() {
        let store = store();
        let schema = SchemaIntrospector::new(&store);
        let kept = validate_and_fix(filter("standard_price"), "product", "internal cost below 100", &schema).unwrap();
        assert_eq!(first_field(&kept), "standard_price");
        let fixed = validate_and_fix(filter("list_price"), "product", "our cost under 100", &schema).unwrap();
        assert_eq!(first_field(&fixed), "standard_price");
    }

    #[test]
    fn test_no_intent_no_rewrite() {
        let store = store();
        let schema = SchemaIntrospector::new(&store);
        let kept = validate_and_fix(filter("standard_price"), "product", "products", &schema).unwrap();
        assert_eq!(first_field(&kept), "standard_price");
    }

    #[test]
    fn test_unknown_and_computed_fields() {
        let store = store();
        let schema = SchemaIntrospector::new(&store);
        match validate_and_fix(filter("colour"), "product", "red products", &schema) {
            Err(ValidationError::UnknownField { field, valid_fields, .. }) => {
                assert_eq!(field, "colour");
                assert_eq!(valid_fields, vec!["categ_ref", "id", "list_price", "name", "standard_price"]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            validate_and_fix(filter("qty_available"), "product", "low stock", &schema),
            Err(ValidationError::ComputedFieldNotQueryable { .. })
        ));
    }

    #[test]
    fn test_relocated_price_field() {
        let store = store();
        let schema = SchemaIntrospector::new(&store);
        let err = validate_and_fix(filter("list_price"), "product_variant", "variants under 100", &schema).unwrap_err();
        assert_eq!(
            err,
            ValidationError::FieldOnOtherEntity {
                field: "list_price".into(),
                entity_type: "product_variant".into(),
                alternate_entity: "product".into(),
            }
        );
    }

    #[test]
    fn test_relation_paths() {
        let store = store();
        let schema = SchemaIntrospector::new(&store);
        assert!(validate_and_fix(filter("categ_ref.name"), "product", "x", &schema).is_ok());
        assert!(matches!(
            validate_and_fix(filter("categ_ref.colour"), "product", "x", &schema),
            Err(ValidationError::UnknownField { entity_type, .. }) if entity_type == "category"
        ));
        assert!(matches!(
            validate_and_fix(filter("name.length"), "product", "x", &schema),
            Err(ValidationError::UnknownField { field, .. }) if field == "name.length"
        ));
    }

    #[test]
    fn test_structured_links() {
        let store = store();
        let schema = SchemaIntrospector::new(&store);
        let ok = CanonicalQuery::Exclusion(Exclusion {
            primary_model: "product".into(),
            secondary_model: "order_line".into(),
            link_field: "product_ref".into(),
        });
        assert!(validate(ok, "product", "never ordered", &schema).is_ok());

        let wrong_target = CanonicalQuery::CountAggregate(CountAggregate {
            primary_model: "product".into(),
            secondary_model: "order_line".into(),
            link_field: "categ_ref".into(),
            threshold: 1,
            comparison: CountComparison::Gte,
        });
        assert!(matches!(
            validate(wrong_target, "product", "x", &schema),
            Err(ValidationError::LinkTargetMismatch { actual, .. }) if actual == "category"
        ));

        let ghost = CanonicalQuery::Exclusion(Exclusion {
            primary_model: "product".into(),
            secondary_model: "ghost".into(),
            link_field: "product_ref".into(),
        });
        assert_eq!(
            validate(ghost, "product", "x", &schema).unwrap_err(),
            ValidationError::UnknownEntity("ghost".into())
        );
    }

    proptest! {
        #[test]
        fn prop_accepts_exactly_persisted_fields(
            persisted in proptest::collection::vec(any::<bool>(), 1..8),
            picks in proptest::collection::vec(0usize..10, 1..6),
        ) {
            let mut schema_def = EntitySchema::new("thing", "things");
            for (i, stored) in persisted.iter().enumerate() {
                let field = FieldDescriptor::new(&format!("f{}", i), FieldType::Integer, "F");
                schema_def = schema_def.field(if *stored { field } else { field.computed() });
            }
            let store = SqliteStore::open_in_memory(vec![schema_def]).unwrap();
            let schema = SchemaIntrospector::new(&store);

            let terms = picks
                .iter()
                .map(|i| FilterTerm::Clause(Clause::new(format!("f{}", i), FilterOp::Eq, Literal::Integer(1))))
                .collect();
            let all_valid = picks.iter().all(|i| persisted.get(*i).copied().unwrap_or(false));

            let result = validate_and_fix(SimpleFilter::new(terms), "thing", "things", &schema);
            prop_assert_eq!(result.is_ok(), all_valid);
            if let Ok(valid) = result {
                let fields = schema.fields_of("thing").unwrap();
                for clause in valid.clauses() {
                    prop_assert!(fields.is_persisted(clause.base_field()));
                }
            }
        }
    }
}
