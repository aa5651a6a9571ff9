//! Typed message roles.
//!
//! A handler's typed parameters and results are plain serde types tagged
//! with a role trait. The role decides how the dispatcher feeds the type:
//! [`RpcHeader`] types are decoded from the envelope header, [`RpcRequest`]
//! types from the body, and [`RpcResponse`] types are encoded into the
//! response body.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serializable-message capability required of every typed payload.
///
/// `Default` is the zero message: an empty payload decodes to it.
pub trait Message: Serialize + DeserializeOwned + Default + Send + Sync + 'static {}

impl<T> Message for T where T: Serialize + DeserializeOwned + Default + Send + Sync + 'static {}

/// Typed envelope header (account, tenant, tracing fields, ...).
pub trait RpcHeader: Message {}

/// Typed request body.
pub trait RpcRequest: Message {
    /// Interface identifier used when a handler is registered by body type.
    /// Defaults to the unqualified type name.
    fn interface_name() -> &'static str {
        short_type_name::<Self>()
    }
}

/// Typed response body.
pub trait RpcResponse: Message {}

/// Unqualified name of `T`, without module path or generic arguments.
#[must_use]
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct AddRequest {
        a: i64,
    }

    impl RpcRequest for AddRequest {}

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Renamed;

    impl RpcRequest for Renamed {
        fn interface_name() -> &'static str {
            "Custom.Name"
        }
    }

    #[test]
    fn interface_name_defaults_to_type_name() {
        assert_eq!(AddRequest::interface_name(), "AddRequest");
    }

    #[test]
    fn interface_name_can_be_overridden() {
        assert_eq!(Renamed::interface_name(), "Custom.Name");
    }

    #[test]
    fn short_type_name_drops_generics() {
        assert_eq!(short_type_name::<Vec<String>>(), "Vec");
    }
}
