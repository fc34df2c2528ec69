//! Entity catalogue: the seven replicated record types and their warehouse shapes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::CollectionNames;
use crate::core::value::SqlNullType;

/// Replicated record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Customer,
    Agent,
    Service,
    Package,
    Sale,
    SaleLine,
    Payment,
}

/// How a column's value is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// Plain value written as-is.
    Value(SqlNullType),
    /// Source id of another entity, resolved to its surrogate `id` at load time.
    Reference(EntityType),
}

/// A mutable warehouse column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
}

const fn value(name: &'static str, null_type: SqlNullType) -> Column {
    Column {
        name,
        kind: ColumnKind::Value(null_type),
    }
}

const fn reference(name: &'static str, entity: EntityType) -> Column {
    Column {
        name,
        kind: ColumnKind::Reference(entity),
    }
}

/// Natural key column present on every warehouse table.
pub const ORIGIN_ID_COLUMN: &str = "origen_id";

/// Surrogate key column assigned by the warehouse.
pub const SURROGATE_ID_COLUMN: &str = "id";

const CUSTOMER_COLUMNS: &[Column] = &[
    value("nombre", SqlNullType::String),
    value("email", SqlNullType::String),
    value("telefono", SqlNullType::String),
    value("fecha_registro", SqlNullType::DateTime),
];

const AGENT_COLUMNS: &[Column] = &[
    value("nombre", SqlNullType::String),
    value("email", SqlNullType::String),
    value("telefono", SqlNullType::String),
];

const SERVICE_COLUMNS: &[Column] = &[
    value("destino_ciudad", SqlNullType::String),
    value("destino_pais", SqlNullType::String),
    value("precio_costo", SqlNullType::Decimal),
];

const PACKAGE_COLUMNS: &[Column] = &[
    value("destino_principal", SqlNullType::String),
    value("precio_total_venta", SqlNullType::Decimal),
];

const SALE_COLUMNS: &[Column] = &[
    reference("cliente_id", EntityType::Customer),
    reference("agente_id", EntityType::Agent),
    value("estado", SqlNullType::String),
    value("monto", SqlNullType::Decimal),
    value("fecha_venta", SqlNullType::DateTime),
    value("puntuacion_satisfaccion", SqlNullType::I32),
];

const SALE_LINE_COLUMNS: &[Column] = &[
    reference("venta_id", EntityType::Sale),
    reference("servicio_id", EntityType::Service),
    reference("paquete_id", EntityType::Package),
    value("descripcion", SqlNullType::String),
    value("cantidad", SqlNullType::I32),
    value("precio_unitario", SqlNullType::Decimal),
    value("subtotal", SqlNullType::Decimal),
];

const PAYMENT_COLUMNS: &[Column] = &[
    reference("venta_id", EntityType::Sale),
    value("monto", SqlNullType::Decimal),
    value("metodo_pago", SqlNullType::String),
    value("estado", SqlNullType::String),
    value("fecha_pago", SqlNullType::DateTime),
];

impl EntityType {
    /// Every entity type, referenced types before the types referencing them.
    pub const ALL: [EntityType; 7] = [
        EntityType::Customer,
        EntityType::Agent,
        EntityType::Service,
        EntityType::Package,
        EntityType::Sale,
        EntityType::SaleLine,
        EntityType::Payment,
    ];

    /// Warehouse table name.
    pub fn table(&self) -> &'static str {
        match self {
            EntityType::Customer => "clientes",
            EntityType::Agent => "agentes",
            EntityType::Service => "servicios",
            EntityType::Package => "paquetes_turisticos",
            EntityType::Sale => "ventas",
            EntityType::SaleLine => "detalle_venta",
            EntityType::Payment => "pagos",
        }
    }

    /// Mutable columns in insert order; `origen_id` is implicit and comes first.
    pub fn columns(&self) -> &'static [Column] {
        match self {
            EntityType::Customer => CUSTOMER_COLUMNS,
            EntityType::Agent => AGENT_COLUMNS,
            EntityType::Service => SERVICE_COLUMNS,
            EntityType::Package => PACKAGE_COLUMNS,
            EntityType::Sale => SALE_COLUMNS,
            EntityType::SaleLine => SALE_LINE_COLUMNS,
            EntityType::Payment => PAYMENT_COLUMNS,
        }
    }

    /// Entity types this one references.
    pub fn dependencies(&self) -> Vec<EntityType> {
        let mut deps: Vec<EntityType> = self
            .columns()
            .iter()
            .filter_map(|c| match c.kind {
                ColumnKind::Reference(e) => Some(e),
                ColumnKind::Value(_) => None,
            })
            .collect();
        deps.dedup();
        deps
    }

    /// Source collection for this entity type.
    pub fn collection<'a>(&self, names: &'a CollectionNames) -> &'a str {
        match self {
            EntityType::Customer => &names.customers,
            EntityType::Agent => &names.agents,
            EntityType::Service => &names.services,
            EntityType::Package => &names.packages,
            EntityType::Sale => &names.sales,
            EntityType::SaleLine => &names.sale_lines,
            EntityType::Payment => &names.payments,
        }
    }

    /// Map a collection name back to its entity type.
    pub fn from_collection(names: &CollectionNames, collection: &str) -> Option<EntityType> {
        Self::ALL
            .into_iter()
            .find(|e| e.collection(names) == collection)
    }

    /// Short lowercase name used in logs and reports.
    pub fn name(&self) -> &'static str {
        match self {
            EntityType::Customer => "customer",
            EntityType::Agent => "agent",
            EntityType::Service => "service",
            EntityType::Package => "package",
            EntityType::Sale => "sale",
            EntityType::SaleLine => "sale_line",
            EntityType::Payment => "payment",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
