//! Document to warehouse row mapping.
//!
//! Source documents are loosely shaped: fields may be camelCase or snake_case,
//! ids may be ObjectIds or strings, and amounts may be doubles, integers or
//! strings. Each mapper reads through those aliases and produces a [`Row`]
//! whose values line up with [`EntityType::columns`].

use std::str::FromStr;

use bson::{Bson, Document};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;

use crate::core::{ColumnKind, EntityType, Row, SqlNullType, SqlValue};
use crate::error::SyncError;
use crate::source::bson_id_string;

/// Status written for sales whose source status is missing or unknown.
pub const DEFAULT_SALE_STATUS: &str = "pendiente";

/// Status written for payments whose source status is missing or unknown.
pub const DEFAULT_PAYMENT_STATUS: &str = "pendiente";

const NO_NAME: &str = "Sin nombre";
const NO_DESTINATION: &str = "Sin destino";

/// Result of transforming one entity type's documents.
#[derive(Debug, Default)]
pub struct TransformOutput {
    pub rows: Vec<Row>,
    /// One `MalformedRecord` per skipped document.
    pub malformed: Vec<SyncError>,
}

/// Map every document; malformed ones are skipped and reported, never fatal.
pub fn transform(entity: EntityType, docs: &[Document]) -> TransformOutput {
    let mut output = TransformOutput::default();
    for doc in docs {
        match transform_document(entity, doc) {
            Ok(row) => output.rows.push(row),
            Err(e) => output.malformed.push(e),
        }
    }
    output
}

/// Map a single document.
pub fn transform_document(entity: EntityType, doc: &Document) -> Result<Row, SyncError> {
    let origin_id = doc
        .get("_id")
        .and_then(bson_id_string)
        .ok_or_else(|| SyncError::malformed(entity.name(), "<no _id>", "missing _id"))?;
    if origin_id.contains('\0') {
        return Err(SyncError::malformed(
            entity.name(),
            origin_id.replace('\0', "\\0"),
            "_id contains a NUL character",
        ));
    }

    let values = match entity {
        EntityType::Customer => map_customer(doc),
        EntityType::Agent => map_agent(doc),
        EntityType::Service => map_service(doc),
        EntityType::Package => map_package(doc),
        EntityType::Sale => map_sale(doc),
        EntityType::SaleLine => map_sale_line(doc),
        EntityType::Payment => map_payment(doc),
    }
    .and_then(|values| check_references(entity, values))
    .map_err(|reason| SyncError::malformed(entity.name(), origin_id.clone(), reason))?;

    Ok(Row::new(origin_id, values))
}

/// Reference ids are matched against `origen_id`, which PostgreSQL text cannot hold NUL in.
fn check_references(entity: EntityType, values: Vec<SqlValue>) -> Mapped {
    for (column, value) in entity.columns().iter().zip(&values) {
        if matches!(column.kind, ColumnKind::Reference(_))
            && value.as_str().is_some_and(|id| id.contains('\0'))
        {
            return Err(format!("{} contains a NUL character", column.name));
        }
    }
    Ok(values)
}

type Mapped = Result<Vec<SqlValue>, String>;

fn map_customer(doc: &Document) -> Mapped {
    let contact = Contact::from_document(doc);
    Ok(vec![
        SqlValue::String(contact.name),
        SqlValue::opt_string(contact.email),
        SqlValue::opt_string(contact.phone),
        SqlValue::opt_datetime(datetime_field(doc, &["fechaRegistro", "fecha_registro", "createdAt"])),
    ])
}

fn map_agent(doc: &Document) -> Mapped {
    let contact = Contact::from_document(doc);
    Ok(vec![
        SqlValue::String(contact.name),
        SqlValue::opt_string(contact.email),
        SqlValue::opt_string(contact.phone),
    ])
}

fn map_service(doc: &Document) -> Mapped {
    Ok(vec![
        SqlValue::opt_string(string_field(doc, &["destinoCiudad", "destino_ciudad", "ciudad"])),
        SqlValue::opt_string(string_field(doc, &["destinoPais", "destino_pais", "pais"])),
        SqlValue::Decimal(amount_field(doc, &["precioCosto", "precio_costo", "costoEstimado", "costo"])?),
    ])
}

fn map_package(doc: &Document) -> Mapped {
    Ok(vec![
        SqlValue::String(resolve_destination(doc)),
        SqlValue::Decimal(amount_field(doc, &["precioTotalVenta", "precio_total_venta", "precio"])?),
    ])
}

fn map_sale(doc: &Document) -> Mapped {
    let sold_at = datetime_field(doc, &["fechaVenta", "fecha_venta", "fecha"])
        .ok_or_else(|| "missing or unparseable fechaVenta".to_string())?;

    Ok(vec![
        reference(doc, &["clienteId", "cliente_id"]),
        reference(doc, &["agenteId", "agente_id"]),
        SqlValue::String(
            normalize_sale_status(string_field(doc, &["estadoVenta", "estado_venta", "estado"]).as_deref())
                .to_string(),
        ),
        SqlValue::Decimal(amount_field(doc, &["montoTotal", "monto_total", "monto", "total"])?),
        SqlValue::DateTime(sold_at),
        int_field(doc, &["puntuacionSatisfaccion", "puntuacion_satisfaccion", "puntuacion"])
            .map_or(SqlValue::Null(SqlNullType::I32), SqlValue::I32),
    ])
}

fn map_sale_line(doc: &Document) -> Mapped {
    let sale = reference(doc, &["ventaId", "venta_id"]);
    if sale.is_null() {
        return Err("missing ventaId".to_string());
    }

    let quantity = int_field(doc, &["cantidad"]).unwrap_or(1);
    let unit_price = amount_field(doc, &["precioUnitario", "precio_unitario"])?;
    let subtotal = match decimal_field(doc, &["subtotal"])? {
        Some(subtotal) => subtotal,
        None => unit_price
            .checked_mul(Decimal::from(quantity))
            .ok_or_else(|| "subtotal overflows".to_string())?,
    };

    Ok(vec![
        sale,
        reference(doc, &["servicioId", "servicio_id"]),
        reference(doc, &["paqueteId", "paquete_id"]),
        SqlValue::String(string_field(doc, &["descripcion"]).unwrap_or_default()),
        SqlValue::I32(quantity),
        SqlValue::Decimal(unit_price),
        SqlValue::Decimal(subtotal),
    ])
}

fn map_payment(doc: &Document) -> Mapped {
    let sale = reference(doc, &["ventaId", "venta_id"]);
    if sale.is_null() {
        return Err("missing ventaId".to_string());
    }

    Ok(vec![
        sale,
        SqlValue::Decimal(amount_field(doc, &["monto", "montoPagado", "monto_pagado"])?),
        SqlValue::opt_string(
            string_field(doc, &["metodoPago", "metodo_pago", "metodo"]).map(|m| m.to_lowercase()),
        ),
        SqlValue::String(
            normalize_payment_status(string_field(doc, &["estadoPago", "estado_pago", "estado"]).as_deref())
                .to_string(),
        ),
        SqlValue::opt_datetime(datetime_field(doc, &["fechaPago", "fecha_pago", "fecha"])),
    ])
}

/// Normalize a sale status to `pendiente | confirmada | pagada | completada | cancelada`.
pub fn normalize_sale_status(raw: Option<&str>) -> &'static str {
    let Some(raw) = raw else {
        return DEFAULT_SALE_STATUS;
    };
    match raw.trim().to_lowercase().as_str() {
        "pendiente" | "pending" => "pendiente",
        "confirmada" | "confirmado" | "confirmed" => "confirmada",
        "pagada" | "pagado" | "paid" => "pagada",
        "completada" | "completado" | "completed" | "finalizada" => "completada",
        "cancelada" | "cancelado" | "cancelled" | "canceled" => "cancelada",
        _ => DEFAULT_SALE_STATUS,
    }
}

/// Normalize a payment status to `pendiente | completado | fallido | reembolsado`.
pub fn normalize_payment_status(raw: Option<&str>) -> &'static str {
    let Some(raw) = raw else {
        return DEFAULT_PAYMENT_STATUS;
    };
    match raw.trim().to_lowercase().as_str() {
        "pendiente" | "pending" => "pendiente",
        "completado" | "completada" | "completed" | "pagado" | "paid" | "aprobado" => "completado",
        "fallido" | "failed" | "rechazado" | "declined" => "fallido",
        "reembolsado" | "refunded" => "reembolsado",
        _ => DEFAULT_PAYMENT_STATUS,
    }
}

/// "City, Country" when both are known, else the principal destination.
pub fn resolve_destination(doc: &Document) -> String {
    let city = string_field(doc, &["destinoCiudad", "destino_ciudad", "ciudad"]);
    let country = string_field(doc, &["destinoPais", "destino_pais", "pais"]);
    match (city, country) {
        (Some(city), Some(country)) => format!("{}, {}", city, country),
        _ => string_field(doc, &["destinoPrincipal", "destino_principal", "destino"])
            .unwrap_or_else(|| NO_DESTINATION.to_string()),
    }
}

/// Name and contact details, from the joined user document when present.
struct Contact {
    name: String,
    email: Option<String>,
    phone: Option<String>,
}

impl Contact {
    fn from_document(doc: &Document) -> Self {
        let user = match doc.get("usuario") {
            Some(Bson::Document(user)) => Some(user),
            _ => None,
        };
        let lookup = |names: &[&str]| {
            user.and_then(|u| string_field(u, names))
                .or_else(|| string_field(doc, names))
        };

        let parts: Vec<String> = [lookup(&["nombre"]), lookup(&["apellido"])]
            .into_iter()
            .flatten()
            .collect();
        let name = if parts.is_empty() {
            NO_NAME.to_string()
        } else {
            parts.join(" ")
        };

        Self {
            name,
            email: lookup(&["email", "correo"]),
            phone: lookup(&["telefono", "phone"]),
        }
    }
}

fn field<'a>(doc: &'a Document, names: &[&str]) -> Option<&'a Bson> {
    named_field(doc, names).map(|(_, value)| value)
}

fn named_field<'a, 'n>(doc: &'a Document, names: &[&'n str]) -> Option<(&'n str, &'a Bson)> {
    names
        .iter()
        .filter_map(|name| doc.get(*name).map(|value| (*name, value)))
        .find(|(_, value)| !matches!(value, Bson::Null | Bson::Undefined))
}

fn reference(doc: &Document, names: &[&str]) -> SqlValue {
    SqlValue::opt_string(field(doc, names).and_then(bson_id_string))
}

fn string_field(doc: &Document, names: &[&str]) -> Option<String> {
    let value = match field(doc, names)? {
        Bson::String(s) => s.trim().to_string(),
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::Int32(n) => n.to_string(),
        Bson::Int64(n) => n.to_string(),
        Bson::Double(n) => n.to_string(),
        Bson::Boolean(b) => b.to_string(),
        _ => return None,
    };
    (!value.is_empty()).then_some(value)
}

/// Money column: absent is zero, present but unreadable is malformed.
fn amount_field(doc: &Document, names: &[&str]) -> Result<Decimal, String> {
    Ok(decimal_field(doc, names)?.unwrap_or(Decimal::ZERO))
}

fn decimal_field(doc: &Document, names: &[&str]) -> Result<Option<Decimal>, String> {
    let Some((name, value)) = named_field(doc, names) else {
        return Ok(None);
    };
    let parsed = match value {
        // Shortest round-trip text keeps 1250.5 from becoming 1250.49999...
        Bson::Double(n) if n.is_finite() => Decimal::from_str(&n.to_string()).ok(),
        Bson::Int32(n) => Some(Decimal::from(*n)),
        Bson::Int64(n) => Some(Decimal::from(*n)),
        Bson::Decimal128(d) => decimal128_to_decimal(d),
        Bson::String(s) if s.trim().is_empty() => return Ok(None),
        Bson::String(s) => {
            let s = s.trim();
            Decimal::from_str(s).or_else(|_| Decimal::from_scientific(s)).ok()
        }
        _ => None,
    };
    parsed
        .map(Some)
        .ok_or_else(|| format!("{} is not a representable amount: {}", name, value))
}

const DECIMAL128_EXPONENT_BIAS: i32 = 6176;
const MAX_DECIMAL_SCALE: i32 = 28;

/// Decode an IEEE 754 BID decimal128. None for NaN, infinities and values
/// outside `Decimal`'s 96-bit range. Digits past scale 28 are rounded.
fn decimal128_to_decimal(d: &bson::Decimal128) -> Option<Decimal> {
    let bits = u128::from_le_bytes(d.bytes());
    let negative = bits >> 127 == 1;
    // Combination field 11xxx: NaN, infinity or a non-canonical coefficient
    if (bits >> 125) & 0b11 == 0b11 {
        return None;
    }
    let exponent = ((bits >> 113) & 0x3fff) as i32 - DECIMAL128_EXPONENT_BIAS;
    let mut coefficient = bits & ((1u128 << 113) - 1);

    let mut scale = -exponent;
    if scale < 0 {
        let factor = 10u128.checked_pow(u32::try_from(-scale).ok()?)?;
        coefficient = coefficient.checked_mul(factor)?;
        scale = 0;
    } else if scale > MAX_DECIMAL_SCALE {
        let dropped = u32::try_from(scale - MAX_DECIMAL_SCALE).ok()?;
        coefficient = match 10u128.checked_pow(dropped) {
            Some(divisor) => (coefficient + divisor / 2) / divisor,
            None => 0,
        };
        scale = MAX_DECIMAL_SCALE;
    }

    let mut mantissa = i128::try_from(coefficient).ok()?;
    if negative {
        mantissa = -mantissa;
    }
    Decimal::try_from_i128_with_scale(mantissa, scale as u32).ok()
}

fn int_field(doc: &Document, names: &[&str]) -> Option<i32> {
    match field(doc, names)? {
        Bson::Int32(n) => Some(*n),
        Bson::Int64(n) => i32::try_from(*n).ok(),
        Bson::Double(n) if n.fract() == 0.0 && n.abs() <= f64::from(i32::MAX) => Some(*n as i32),
        Bson::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn datetime_field(doc: &Document, names: &[&str]) -> Option<NaiveDateTime> {
    match field(doc, names)? {
        Bson::DateTime(dt) => DateTime::from_timestamp_millis(dt.timestamp_millis()).map(|d| d.naive_utc()),
        Bson::String(s) => parse_datetime(s.trim()),
        _ => None,
    }
}

fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}
