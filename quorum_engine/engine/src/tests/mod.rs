mod support;

mod coordinator_test;
