pub mod fakes;
pub mod mock_proxy;
pub mod tls;
