diesel::table! {
    viber_users (viber_id) {
        viber_id -> Text,
        viber_name -> Text,
        matrix_user_id -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    room_mappings (id) {
        id -> Integer,
        viber_chat_id -> Text,
        matrix_room_id -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    message_mappings (id) {
        id -> Integer,
        viber_message_id -> Text,
        matrix_event_id -> Text,
        viber_chat_id -> Text,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    group_members (viber_chat_id, viber_user_id) {
        viber_chat_id -> Text,
        viber_user_id -> Text,
        viber_user_name -> Text,
        joined_at -> Text,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    viber_users,
    room_mappings,
    message_mappings,
    group_members,
);
