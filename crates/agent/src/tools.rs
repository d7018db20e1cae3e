//! Function-calling schema the reasoning service uses to close an order.

use leadflow_core::domain::order::OrderDraft;
use serde_json::{json, Value};

/// Name of the single tool exposed to the model. A call to it is the signal
/// that the customer confirmed a purchase and delivery data is complete.
pub const ORDER_TOOL_NAME: &str = "update_delivery_info";

/// Tool definition in the chat-completions `tools` array format. Parameter
/// keys mirror the Spanish field names the CRM form uses. Only the delivery
/// destination is hard-required; the executor writes whatever else was
/// captured and the prompt pushes the model to collect the rest.
pub fn order_tool_definition() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": ORDER_TOOL_NAME,
            "description": "Guardar datos de despacho cuando el cliente confirme la compra.",
            "parameters": {
                "type": "object",
                "properties": {
                    "nombre": { "type": "string", "description": "Nombre del cliente" },
                    "apellido": { "type": "string", "description": "Apellido del cliente" },
                    "cedula": { "type": "string", "description": "Número de cédula o documento" },
                    "telefono": { "type": "string", "description": "Teléfono de contacto" },
                    "email": { "type": "string", "description": "Correo electrónico" },
                    "departamento": { "type": "string", "description": "Departamento de entrega" },
                    "ciudad": { "type": "string", "description": "Ciudad de entrega" },
                    "direccion": { "type": "string", "description": "Dirección completa de entrega" },
                    "cantidad": { "type": "integer", "description": "Unidades pedidas, mínimo 1" }
                },
                "required": ["direccion", "ciudad"]
            }
        }
    })
}

/// Decodes the JSON-encoded `arguments` string of a tool call. Missing keys
/// are tolerated; the executor writes whatever was captured.
pub fn parse_order_arguments(raw: &str) -> Result<OrderDraft, serde_json::Error> {
    serde_json::from_str(raw)
}
