pub mod s3_service;
