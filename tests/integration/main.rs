mod connection_test;
mod pool_test;
mod support;
