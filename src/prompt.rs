//! Prompt construction for filter interpretation.
//!
//! Everything here is a pure function of the schema view and the query text.

use crate::schema::{FieldSet, InboundLink, MAX_PROMPT_FIELDS};
use std::fmt::Write;

pub const SYSTEM_INSTRUCTION: &str = "You translate natural-language search requests into \
structured queries over a typed data model. Respond with exactly one answer in the \
requested format and nothing else: no explanations, no markdown.";

/// Schema view a prompt is built from.
pub struct PromptContext<'a> {
    pub entity_type: &'a str,
    pub description: Option<&'a str>,
    pub fields: &'a FieldSet,
    /// Linking fields on other entity types that point at `entity_type`.
    pub inbound: &'a [InboundLink],
}

/// Curated description and worked examples for a well-known entity type.
pub struct EntityProfile {
    pub entity_type: &'static str,
    pub description: &'static str,
    pub examples: &'static [(&'static str, &'static str)],
    pub notes: Option<&'static str>,
}

static PROFILES: &[EntityProfile] = &[
    EntityProfile {
        entity_type: "contact",
        description: "Contacts, customers, suppliers and companies",
        examples: &[
            ("Customers from Milan", "[('city', 'icontains', 'Milan'), ('customer_rank', '>', 0)]"),
            ("Suppliers", "[('supplier_rank', '>', 0)]"),
            ("Active contacts", "[('active', '=', True)]"),
            ("Contacts without email", "[('email', '=', None)]"),
        ],
        notes: None,
    },
    EntityProfile {
        entity_type: "client",
        description: "Client accounts that receive invoices and place orders",
        examples: &[
            ("Active clients", "[('active', '=', True)]"),
            ("Clients in Rome or Turin", "['|', ('city', '=', 'Rome'), ('city', '=', 'Turin')]"),
            ("Clients with credit limit above 5000", "[('credit_limit', '>', 5000)]"),
        ],
        notes: None,
    },
    EntityProfile {
        entity_type: "invoice",
        description: "Invoices and bills (posted documents)",
        examples: &[
            ("Unpaid invoices", "[('state', '=', 'posted'), ('payment_state', '=', 'not_paid')]"),
            (
                "Invoices from January 2025",
                "[('invoice_date', '>=', '2025-01-01'), ('invoice_date', '<', '2025-02-01')]",
            ),
            ("Large invoices over 1000", "[('amount_total', '>', 1000)]"),
        ],
        notes: None,
    },
    EntityProfile {
        entity_type: "product",
        description: "Product templates (selling prices, costs and categories)",
        examples: &[
            ("Products under 100 euros", "[('list_price', '<', 100)]"),
            ("Products with internal cost above 50", "[('standard_price', '>', 50)]"),
            ("Active products", "[('active', '=', True)]"),
            ("Electronics products", "[('categ_ref.name', 'icontains', 'Electronics')]"),
        ],
        notes: Some(
            "list_price is the SELLING price (price, euro, cheaper, expensive). \
             standard_price is the INTERNAL cost; use it only for \"internal cost\", \"our cost\" or \"cost price\".",
        ),
    },
    EntityProfile {
        entity_type: "product_variant",
        description: "Product variants (specific SKUs)",
        examples: &[
            ("Variants with barcode starting with 123", "[('barcode', 'contains', '123')]"),
            ("Active variants", "[('active', '=', True)]"),
        ],
        notes: Some("Prices are not stored on variants; price questions belong to the product entity."),
    },
    EntityProfile {
        entity_type: "sale_order",
        description: "Sales orders",
        examples: &[
            ("Draft orders", "[('state', '=', 'draft')]"),
            ("Orders over 500", "[('amount_total', '>', 500)]"),
        ],
        notes: None,
    },
    EntityProfile {
        entity_type: "purchase_order",
        description: "Purchase orders",
        examples: &[
            ("Pending requests for quotation", "[('state', '=', 'draft')]"),
            ("Confirmed purchases", "[('state', 'in', ['purchase', 'done'])]"),
        ],
        notes: None,
    },
    EntityProfile {
        entity_type: "order_line",
        description: "Sales order lines",
        examples: &[
            ("Lines with more than 10 units", "[('quantity', '>', 10)]"),
            ("Lines for desks", "[('product_ref.name', 'icontains', 'desk')]"),
        ],
        notes: None,
    },
    EntityProfile {
        entity_type: "stock_move",
        description: "Stock movements and inventory",
        examples: &[
            ("Moves in progress", "[('state', '=', 'confirmed')]"),
            ("Done moves", "[('state', '=', 'done')]"),
        ],
        notes: None,
    },
    EntityProfile {
        entity_type: "lead",
        description: "CRM leads and opportunities",
        examples: &[
            ("Open opportunities", "[('probability', '>', 0), ('probability', '<', 100)]"),
            ("Lost deals", "[('probability', '=', 0)]"),
        ],
        notes: None,
    },
    EntityProfile {
        entity_type: "task",
        description: "Project tasks and work items",
        examples: &[
            ("Open tasks", "[('state', 'in', ['todo', 'in_progress'])]"),
            ("Completed tasks", "[('state', '=', 'done')]"),
        ],
        notes: None,
    },
];

static GENERIC_EXAMPLES: &[(&str, &str)] = &[
    ("Records named like acme", "[('name', 'icontains', 'acme')]"),
    ("Active records", "[('active', '=', True)]"),
    ("Records created since 2025", "[('create_date', '>=', '2025-01-01')]"),
];

pub fn profile(entity_type: &str) -> Option<&'static EntityProfile> {
    PROFILES.iter().find(|p| p.entity_type == entity_type)
}

/// Build the interpretation prompt for one query.
pub fn build_filter_prompt(ctx: &PromptContext<'_>, query_text: &str) -> String {
    let profile = profile(ctx.entity_type);
    let description = ctx
        .description
        .or(profile.map(|p| p.description))
        .unwrap_or(ctx.entity_type);

    let mut prompt = String::new();
    let _ = writeln!(prompt, "TASK: Convert the search request into a query for entity \"{}\".", ctx.entity_type);
    let _ = writeln!(prompt, "\n===== ENTITY =====");
    let _ = writeln!(prompt, "Entity: {}\nDescription: {}", ctx.entity_type, description);

    let _ = writeln!(prompt, "\n===== AVAILABLE FIELDS (STORED ONLY - USE ONLY THESE) =====");
    prompt.push_str(&field_list(ctx.fields));

    if !ctx.inbound.is_empty() {
        let _ = writeln!(prompt, "\n===== RELATED ENTITIES LINKING TO {} =====", ctx.entity_type);
        for link in ctx.inbound {
            let _ = writeln!(
                prompt,
                "- {}.{} ({}) -> {}",
                link.entity_type, link.field, link.label, ctx.entity_type
            );
        }
    }

    let _ = writeln!(prompt, "\n===== EXAMPLES FOR THIS ENTITY =====");
    let examples = profile.map(|p| p.examples).unwrap_or(GENERIC_EXAMPLES);
    for (question, answer) in examples {
        let _ = writeln!(prompt, "- \"{}\" -> {}", question, answer);
    }
    if let Some(notes) = profile.and_then(|p| p.notes) {
        let _ = writeln!(prompt, "NOTE: {}", notes);
    }

    let _ = writeln!(prompt, "\n===== DECISION RULE =====");
    let _ = writeln!(
        prompt,
        "1. If the request filters {} by its own fields, answer with a FILTER LIST.",
        ctx.entity_type
    );
    let _ = writeln!(
        prompt,
        "2. If it counts or excludes related records (\"with more than N ...\", \"without any ...\", \"never ...\"), \
         answer with a STRUCTURED JSON OBJECT using one of the related links above."
    );
    let _ = writeln!(
        prompt,
        "3. If neither can express it, answer {{\"query_type\": \"unsupported\", \"reason\": \"...\"}}."
    );

    let _ = writeln!(prompt, "\n===== FILTER LIST RULES =====");
    prompt.push_str(FILTER_RULES);

    let _ = writeln!(prompt, "\n===== OUTPUT SHAPES =====");
    prompt.push_str(&output_shapes(ctx));

    let _ = writeln!(prompt, "\n===== YOUR TASK =====");
    let _ = writeln!(prompt, "Query: \"{}\"", query_text.trim());
    prompt.push_str("Response (only the list or the JSON object):");
    prompt
}

const FILTER_RULES: &str = "\
1. Respond with a list of tuples: [('field', 'operator', value), ...]
2. Every field name must exactly match one from the list above; never invent fields
3. Operators: '=', '!=', '>', '<', '>=', '<=', 'contains', 'icontains', 'in', 'not_in'
4. Clauses are combined with AND; prefix '|' (OR) or '!' (NOT) before their operands
5. Dates as 'YYYY-MM-DD'; numbers without currency symbols; booleans True/False; empty as None
6. A link field can be traversed: ('link_field.name', 'icontains', 'text')
7. To match every record respond with []
";

fn field_list(fields: &FieldSet) -> String {
    let mut out = String::new();
    for field in fields.persisted().take(MAX_PROMPT_FIELDS) {
        let _ = write!(out, "- {} ({}): {}", field.name, field.field_type.as_str(), field.label);
        if let Some(target) = &field.relation {
            let _ = write!(out, " -> {}", target);
        }
        out.push('\n');
    }
    out
}

fn output_shapes(ctx: &PromptContext<'_>) -> String {
    let (secondary, link) = ctx
        .inbound
        .first()
        .map(|l| (l.entity_type.as_str(), l.field.as_str()))
        .unwrap_or(("invoice", "client_ref"));
    let primary = ctx.entity_type;

    let mut out = String::new();
    let _ = writeln!(out, "Filter list:\n[('active', '=', True), ('name', 'icontains', 'acme')]");
    let _ = writeln!(
        out,
        "Count aggregate (\"{primary} with more than 10 {secondary}\"):\n\
         {{\"query_type\": \"count_aggregate\", \"primary_model\": \"{primary}\", \"secondary_model\": \"{secondary}\", \
         \"link_field\": \"{link}\", \"threshold\": 10, \"operator\": \">\"}}"
    );
    let _ = writeln!(
        out,
        "Exclusion (\"{primary} without any {secondary}\"):\n\
         {{\"query_type\": \"exclusion\", \"primary_model\": \"{primary}\", \"secondary_model\": \"{secondary}\", \
         \"link_field\": \"{link}\"}}"
    );
    let _ = writeln!(
        out,
        "Unsupported:\n{{\"query_type\": \"unsupported\", \"reason\": \"ranking is not expressible\"}}"
    );
    out
}
