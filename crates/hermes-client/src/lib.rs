pub mod dispatcher;

pub use dispatcher::ReqwestDispatcher;
