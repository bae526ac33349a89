pub mod account_tests;
pub mod invite_tests;
pub mod mock_broker;
pub mod parse_tests;
pub mod test_utils;
