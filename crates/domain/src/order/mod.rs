//! Order records and the inputs that create them.

mod model;
mod request;
mod state;
mod value_objects;

pub use model::{CartItem, Order, OrderLine, generate_order_number};
pub use request::{OrderCreationRequest, PaymentMethod, validate_amounts, validate_currency};
pub use state::{OrderStatus, PaymentStatus, PaymentTransition};
pub use value_objects::{Money, OrderItem, ProductId};
