//! Typed field descriptors and the schema introspector.
//!
//! The descriptor list returned by the store is the single source of truth for
//! which fields a query may reference.

use crate::error::StoreError;
use crate::store::EntityStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Fields listed to the model or in error messages are capped at these sizes.
pub const MAX_PROMPT_FIELDS: usize = 50;
pub const MAX_SUGGESTED_FIELDS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Char,
    Text,
    Integer,
    Float,
    Monetary,
    Boolean,
    Date,
    Datetime,
    Selection,
    Many2one,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Char => "char",
            FieldType::Text => "text",
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::Monetary => "monetary",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::Datetime => "datetime",
            FieldType::Selection => "selection",
            FieldType::Many2one => "many2one",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub label: String,
    /// False for fields computed on read; those have no column.
    #[serde(default = "default_persisted")]
    pub persisted: bool,
    /// Target entity type of a linking field.
    #[serde(default)]
    pub relation: Option<String>,
}

fn default_persisted() -> bool {
    true
}

impl FieldDescriptor {
    pub fn new(name: &str, field_type: FieldType, label: &str) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            label: label.to_string(),
            persisted: true,
            relation: None,
        }
    }

    pub fn link(name: &str, target: &str, label: &str) -> Self {
        Self {
            relation: Some(target.to_string()),
            ..Self::new(name, FieldType::Many2one, label)
        }
    }

    pub fn computed(mut self) -> Self {
        self.persisted = false;
        self
    }

    pub fn is_private(&self) -> bool {
        self.name.starts_with('_')
    }
}

/// Storage-side description of one entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySchema {
    pub entity_type: String,
    pub table: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_display_field")]
    pub display_field: String,
    pub fields: Vec<FieldDescriptor>,
}

fn default_display_field() -> String {
    "name".to_string()
}

impl EntitySchema {
    /// Starts with the implicit `id` field.
    pub fn new(entity_type: &str, table: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            table: table.to_string(),
            description: None,
            display_field: default_display_field(),
            fields: vec![FieldDescriptor::new("id", FieldType::Integer, "ID")],
        }
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn display(mut self, field: &str) -> Self {
        self.display_field = field.to_string();
        self
    }

    pub fn field(mut self, descriptor: FieldDescriptor) -> Self {
        self.fields.push(descriptor);
        self
    }
}

/// Public fields of one entity type, in declaration order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FieldSet {
    fields: Vec<FieldDescriptor>,
}

impl FieldSet {
    pub fn new(fields: Vec<FieldDescriptor>) -> Self {
        Self {
            fields: fields.into_iter().filter(|f| !f.is_private()).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter()
    }

    pub fn persisted(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|f| f.persisted)
    }

    pub fn is_persisted(&self, name: &str) -> bool {
        self.get(name).is_some_and(|f| f.persisted)
    }

    /// Sorted, capped list of queryable field names for error guidance.
    pub fn suggestions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.persisted().map(|f| f.name.clone()).collect();
        names.sort();
        names.truncate(MAX_SUGGESTED_FIELDS);
        names
    }
}

/// A linking field on another entity type that points at the inspected one.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundLink {
    pub entity_type: String,
    pub field: String,
    pub label: String,
}

/// Per-request view over the store's schema.
///
/// Caches field sets for the lifetime of one query; a fresh introspector is
/// created for every request so configuration changes are always picked up.
pub struct SchemaIntrospector<'s> {
    store: &'s dyn EntityStore,
    cache: Mutex<HashMap<String, Arc<FieldSet>>>,
}

impl<'s> SchemaIntrospector<'s> {
    pub fn new(store: &'s dyn EntityStore) -> Self {
        Self {
            store,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &'s dyn EntityStore {
        self.store
    }

    pub fn fields_of(&self, entity_type: &str) -> Result<Arc<FieldSet>, StoreError> {
        if let Some(cached) = self.cache.lock().get(entity_type) {
            return Ok(Arc::clone(cached));
        }
        let fields = Arc::new(FieldSet::new(self.store.fields_of(entity_type)?));
        self.cache
            .lock()
            .insert(entity_type.to_string(), Arc::clone(&fields));
        Ok(fields)
    }

    /// Linking fields of every other entity type whose relation targets `entity_type`.
    pub fn inbound_links(&self, entity_type: &str) -> Result<Vec<InboundLink>, StoreError> {
        let mut links = Vec::new();
        for other in self.store.entity_types() {
            let fields = self.fields_of(&other)?;
            for field in fields.persisted() {
                if field.relation.as_deref() == Some(entity_type) {
                    links.push(InboundLink {
                        entity_type: other.clone(),
                        field: field.name.clone(),
                        label: field.label.clone(),
                    });
                }
            }
        }
        Ok(links)
    }
}
