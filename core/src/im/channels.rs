//! Concrete IM channels. Each one implements `ImTransport` and feeds the dispatcher.

pub mod telegram;
