mod credential_tests;
mod policy_refresh_tests;
mod reverse_proxy_tests;
mod tls_tests;
