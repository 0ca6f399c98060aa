/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Diesel table definitions for the SQLite backend.

diesel::table! {
    kv (key) {
        key -> Text,
        value -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    runs (id) {
        id -> Text,
        pipeline_name -> Text,
        status -> Text,
        started_at -> Text,
        completed_at -> Nullable<Text>,
        trigger_type -> Text,
        trigger_config -> Text,
        error_text -> Nullable<Text>,
    }
}

diesel::table! {
    tasks (id) {
        id -> Integer,
        run_id -> Text,
        task_id -> Text,
        task_name -> Text,
        status -> Text,
        started_at -> Nullable<Text>,
        completed_at -> Nullable<Text>,
        attempts -> Integer,
        result_output -> Nullable<Text>,
        result_error -> Nullable<Text>,
        result_metadata -> Nullable<Text>,
    }
}

diesel::joinable!(tasks -> runs (run_id));

diesel::allow_tables_to_appear_in_same_query!(kv, runs, tasks);
