pub mod flash_sale;
pub mod login;

pub use flash_sale::{effective_status, FlashSaleBook, FlashSaleError, FlashSaleEvent};
pub use login::{
    ClaimedRole, LoginAction, LoginContext, LoginEvent, LoginFlow, LoginTransition,
    LoginTransitionError,
};
