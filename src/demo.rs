//! 演示数据：一个小型的内存 SQLite 数据集，供命令行和基准测试使用。

use crate::ast::Literal;
use crate::error::StoreError;
use crate::schema::{EntitySchema, FieldDescriptor, FieldType};
use crate::store::SqliteStore;

pub fn schemas() -> Vec<EntitySchema> {
    vec![
        EntitySchema::new("contact", "contacts")
            .describe("Contacts, customers and suppliers")
            .field(FieldDescriptor::new("name", FieldType::Char, "Name"))
            .field(FieldDescriptor::new("email", FieldType::Char, "Email"))
            .field(FieldDescriptor::new("city", FieldType::Char, "City"))
            .field(FieldDescriptor::new("active", FieldType::Boolean, "Active"))
            .field(FieldDescriptor::new("customer_rank", FieldType::Integer, "Customer Rank"))
            .field(FieldDescriptor::new("supplier_rank", FieldType::Integer, "Supplier Rank")),
        EntitySchema::new("client", "clients")
            .describe("Invoiced customers")
            .field(FieldDescriptor::new("name", FieldType::Char, "Name"))
            .field(FieldDescriptor::new("city", FieldType::Char, "City"))
            .field(FieldDescriptor::new("country", FieldType::Char, "Country")),
        EntitySchema::new("invoice", "invoices")
            .display("number")
            .field(FieldDescriptor::new("number", FieldType::Char, "Number"))
            .field(FieldDescriptor::link("client_ref", "client", "Client"))
            .field(FieldDescriptor::new("amount_total", FieldType::Monetary, "Total"))
            .field(FieldDescriptor::new("state", FieldType::Selection, "Status"))
            .field(FieldDescriptor::new("invoice_date", FieldType::Date, "Invoice Date")),
        EntitySchema::new("category", "categories")
            .field(FieldDescriptor::new("name", FieldType::Char, "Name")),
        EntitySchema::new("product", "products")
            .field(FieldDescriptor::new("name", FieldType::Char, "Name"))
            .field(FieldDescriptor::new("list_price", FieldType::Monetary, "Sales Price"))
            .field(FieldDescriptor::new("standard_price", FieldType::Monetary, "Cost"))
            .field(FieldDescriptor::link("categ_ref", "category", "Category"))
            .field(FieldDescriptor::new("qty_available", FieldType::Float, "Quantity On Hand").computed()),
        EntitySchema::new("product_variant", "product_variants")
            .display("default_code")
            .field(FieldDescriptor::new("default_code", FieldType::Char, "Internal Reference"))
            .field(FieldDescriptor::link("product_ref", "product", "Product")),
        EntitySchema::new("sale_order", "sale_orders")
            .field(FieldDescriptor::new("name", FieldType::Char, "Order Reference"))
            .field(FieldDescriptor::link("client_ref", "client", "Customer"))
            .field(FieldDescriptor::new("amount_total", FieldType::Monetary, "Total"))
            .field(FieldDescriptor::new("state", FieldType::Selection, "Status"))
            .field(FieldDescriptor::new("date_order", FieldType::Datetime, "Order Date")),
        EntitySchema::new("order_line", "order_lines")
            .field(FieldDescriptor::link("order_ref", "sale_order", "Order"))
            .field(FieldDescriptor::link("product_ref", "product", "Product"))
            .field(FieldDescriptor::new("quantity", FieldType::Float, "Quantity"))
            .field(FieldDescriptor::new("price_unit", FieldType::Monetary, "Unit Price")),
    ]
}

fn text(value: &str) -> Literal {
    Literal::String(value.to_string())
}

/// 创建内存数据库并写入固定的演示数据
pub fn seeded_store() -> Result<SqliteStore, StoreError> {
    let store = SqliteStore::open_in_memory(schemas())?;

    let contacts = [
        ("Ada Lovelace", "ada@example.com", "London", true, 1, 0),
        ("Bruno Bianchi", "", "Milan", true, 2, 0),
        ("Carla Rossi", "carla@example.com", "Rome", false, 0, 1),
        ("Dario Verdi", "dario@example.com", "Milan", true, 0, 3),
    ];
    for (name, email, city, active, customer_rank, supplier_rank) in contacts {
        let email = if email.is_empty() { Literal::Null } else { text(email) };
        store.insert(
            "contact",
            &[
                ("name", text(name)),
                ("email", email),
                ("city", text(city)),
                ("active", Literal::Bool(active)),
                ("customer_rank", Literal::Integer(customer_rank)),
                ("supplier_rank", Literal::Integer(supplier_rank)),
            ],
        )?;
    }

    // 每个客户的发票数量不同，便于演示计数查询
    let clients = [
        ("Acme Srl", "Milan", "Italy", 12),
        ("Globex", "Rome", "Italy", 3),
        ("Initech", "Berlin", "Germany", 0),
        ("Umbrella", "Paris", "France", 7),
    ];
    let mut invoice_no = 0;
    let mut client_ids = Vec::new();
    for (name, city, country, invoices) in clients {
        let client = store.insert(
            "client",
            &[("name", text(name)), ("city", text(city)), ("country", text(country))],
        )?;
        client_ids.push(client);
        for i in 0..invoices {
            invoice_no += 1;
            let state = if i % 3 == 0 { "draft" } else { "posted" };
            store.insert(
                "invoice",
                &[
                    ("number", text(&format!("INV/2024/{:04}", invoice_no))),
                    ("client_ref", Literal::Integer(client)),
                    ("amount_total", Literal::Float(150.0 * (i + 1) as f64)),
                    ("state", text(state)),
                    ("invoice_date", text(&format!("2024-{:02}-15", (i % 12) + 1))),
                ],
            )?;
        }
    }

    let furniture = store.insert("category", &[("name", text("Furniture"))])?;
    let office = store.insert("category", &[("name", text("Office Supplies"))])?;

    let products = [
        ("Desk", 320.0, 180.0, furniture),
        ("Chair", 95.0, 40.0, furniture),
        ("Lamp", 45.0, 12.5, furniture),
        ("Stapler", 9.9, 2.1, office),
        ("Notebook", 3.5, 0.8, office),
    ];
    let mut product_ids = Vec::new();
    for (name, list_price, standard_price, category) in products {
        let product = store.insert(
            "product",
            &[
                ("name", text(name)),
                ("list_price", Literal::Float(list_price)),
                ("standard_price", Literal::Float(standard_price)),
                ("categ_ref", Literal::Integer(category)),
            ],
        )?;
        store.insert(
            "product_variant",
            &[
                ("default_code", text(&format!("{}-STD", name.to_uppercase()))),
                ("product_ref", Literal::Integer(product)),
            ],
        )?;
        product_ids.push(product);
    }

    // Lamp 和 Notebook 从未被下单
    let orders = [
        ("SO001", client_ids[0], "sale", vec![(0, 2.0), (1, 4.0)]),
        ("SO002", client_ids[1], "sale", vec![(1, 10.0)]),
        ("SO003", client_ids[3], "draft", vec![(3, 25.0), (0, 1.0)]),
    ];
    for (name, client, state, lines) in orders {
        let total: f64 = lines.iter().map(|(p, qty)| products[*p].1 * qty).sum();
        let order = store.insert(
            "sale_order",
            &[
                ("name", text(name)),
                ("client_ref", Literal::Integer(client)),
                ("amount_total", Literal::Float(total)),
                ("state", text(state)),
                ("date_order", text("2024-05-02 10:00:00")),
            ],
        )?;
        for (p, qty) in lines {
            store.insert(
                "order_line",
                &[
                    ("order_ref", Literal::Integer(order)),
                    ("product_ref", Literal::Integer(product_ids[p])),
                    ("quantity", Literal::Float(qty)),
                    ("price_unit", Literal::Float(products[p].1)),
                ],
            )?;
        }
    }

    Ok(store)
}
